//! Per-node session store.
//!
//! Sessions are keyed by id; each one sits behind its own async mutex so phases of different
//! sessions never contend. `get` waits for a session that has not been created yet, because a
//! node can receive a phase trigger before the survey query itself.

use crate::errors::SurveyError;
use crate::models::{GroupedResponse, NodeId, SessionId, SurveyQuery};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use survey_zk::elgamal::CipherVector;
use survey_zk::proofs::{ProofCategory, ShuffleRandomness};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// How long a message handler waits for a session it has not seen yet.
pub const DEFAULT_SESSION_WAIT: Duration = Duration::from_secs(30);

/// Output of this node's data-collection phase.
#[derive(Clone, Debug, Default)]
pub struct Collected {
    /// Per-group sum over this node's providers.
    pub sum: GroupedResponse,
    /// The individual provider responses, kept for the aggregation proof.
    pub responses: Vec<GroupedResponse>,
}

/// `Err` carries the reason the phase failed on this node.
pub type CollectionOutcome = Result<Collected, String>;

pub struct Session {
    pub survey: SurveyQuery,
    pub aggregate: Option<GroupedResponse>,
    pub noise: Option<CipherVector>,
    pub shuffle_randomness: Option<ShuffleRandomness>,
    collected: watch::Sender<Option<CollectionOutcome>>,
    proof_tasks: HashMap<(ProofCategory, NodeId), JoinHandle<()>>,
}

impl Session {
    fn new(survey: SurveyQuery) -> Self {
        let (collected, _) = watch::channel(None);
        Self {
            survey,
            aggregate: None,
            noise: None,
            shuffle_randomness: None,
            collected,
            proof_tasks: HashMap::new(),
        }
    }

    pub fn set_collected(&mut self, outcome: CollectionOutcome) {
        self.collected.send_replace(Some(outcome));
    }

    pub fn subscribe_collected(&self) -> watch::Receiver<Option<CollectionOutcome>> {
        self.collected.subscribe()
    }

    /// Track an in-flight proof task; a previous task under the same key is aborted.
    pub fn register_proof_task(&mut self, category: ProofCategory, node: NodeId, handle: JoinHandle<()>) {
        if let Some(old) = self.proof_tasks.insert((category, node), handle) {
            old.abort();
        }
    }

    pub fn pending_proof_tasks(&mut self) -> usize {
        self.proof_tasks.retain(|_, h| !h.is_finished());
        self.proof_tasks.len()
    }

    /// Hand over the outstanding proof tasks so the caller can wait for them.
    pub fn take_proof_tasks(&mut self) -> Vec<JoinHandle<()>> {
        self.proof_tasks.drain().map(|(_, h)| h).collect()
    }

    fn abort_proof_tasks(&mut self) {
        for (_, handle) in self.proof_tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.abort_proof_tasks();
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

struct Entry {
    survey: SurveyQuery,
    handle: SessionHandle,
}

pub struct SessionStore {
    sessions: StdMutex<HashMap<SessionId, Entry>>,
    created: Notify,
    wait: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_wait(DEFAULT_SESSION_WAIT)
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose handlers give up on a missing session after `wait`.
    pub fn with_wait(wait: Duration) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            created: Notify::new(),
            wait,
        }
    }

    fn lookup(&self, id: &SessionId) -> Option<SessionHandle> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(id).map(|e| e.handle.clone())
    }

    /// Create a session, or return the existing one if it was created for the same survey.
    pub fn create(&self, survey: SurveyQuery) -> Result<SessionHandle, SurveyError> {
        let id = survey.session_id;
        let handle = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = sessions.get(&id) {
                if existing.survey.same_survey(&survey) {
                    return Ok(existing.handle.clone());
                }
                return Err(SurveyError::DuplicateSession(id.to_string()));
            }
            let handle = Arc::new(Mutex::new(Session::new(survey.clone())));
            sessions.insert(
                id,
                Entry {
                    survey,
                    handle: handle.clone(),
                },
            );
            handle
        };
        self.created.notify_waiters();
        tracing::debug!(%id, "session created");
        Ok(handle)
    }

    /// Wait until the session exists.
    pub async fn get(&self, id: &SessionId) -> SessionHandle {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let notified = self.created.notified();
            if let Some(handle) = self.lookup(id) {
                return handle;
            }
            let _ = tokio::time::timeout(backoff, notified).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Like [`get`](Self::get), but a session that does not show up within the store's wait
    /// is `UnknownSession`: it was torn down or never reached this node.
    pub async fn get_within(&self, id: &SessionId) -> Result<SessionHandle, SurveyError> {
        tokio::time::timeout(self.wait, self.get(id))
            .await
            .map_err(|_| SurveyError::UnknownSession(id.to_string()))
    }

    pub fn try_get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.lookup(id)
    }

    /// Apply `f` under the session's exclusive lock.
    pub async fn mutate<R>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> R) -> Result<R, SurveyError> {
        let handle = self.get_within(id).await?;
        let mut session = handle.lock().await;
        Ok(f(&mut session))
    }

    /// Tear the session down, aborting its outstanding proof tasks.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let entry = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.remove(id)
        };
        match entry {
            Some(entry) => {
                entry.handle.lock().await.abort_proof_tasks();
                tracing::debug!(%id, "session removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
