//! Verifying nodes and the proof threshold gate.
//!
//! Every verifying node checks every proof it receives and reports a verdict to the gate, which
//! lives on the first verifying node of the survey's roster. The gate decides the session's
//! disposition and writes it to the ledger exactly once.

use crate::db::{self, Db};
use crate::errors::SurveyError;
use crate::models::{BlockRef, Disposition, NodeId, ProofMode, SessionId, SurveyQuery, Thresholds, VerificationBitmap};
use crate::network::{Envelope, Mailbox, Message, Network, ProofRecord, Verdict};
use crate::protocols::children;
use crate::session::{SessionStore, DEFAULT_SESSION_WAIT};
use crate::state::ProofKeys;
use crate::validation::{required_categories, required_proof_counts};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use survey_zk::proofs::{ProofCategory, VerifyContext};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Ledger handle that serialises appends so the hash chain never forks.
#[derive(Clone)]
pub struct Ledger {
    db: Db,
    append_lock: Arc<Mutex<()>>,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub async fn append(
        &self,
        session: SessionId,
        bitmap: &VerificationBitmap,
        disposition: Disposition,
    ) -> Result<BlockRef, SurveyError> {
        let _guard = self.append_lock.lock().await;
        db::append_block(&self.db, session, bitmap, disposition).await
    }

    pub async fn latest(&self, session: SessionId) -> Result<Option<BlockRef>, SurveyError> {
        db::latest_block(&self.db, session).await
    }
}

// ---------------------------------------------------------------------------------------------
// Threshold law
// ---------------------------------------------------------------------------------------------

/// Disposition for the current counts.
///
/// `gating` maps each category that must be proved to its threshold; `attesting` and
/// `rejecting` count verifying nodes per category.
pub fn evaluate(
    gating: &BTreeMap<ProofCategory, u32>,
    roster_size: usize,
    attesting: &VerificationBitmap,
    rejecting: &BTreeMap<ProofCategory, usize>,
) -> Disposition {
    for (category, threshold) in gating {
        let rejected = rejecting.get(category).copied().unwrap_or(0);
        if roster_size.saturating_sub(rejected) < *threshold as usize {
            return Disposition::Disputed;
        }
    }
    let proved = gating
        .iter()
        .all(|(c, t)| attesting.get(c).copied().unwrap_or(0) >= *t);
    if proved {
        Disposition::Verified
    } else {
        Disposition::Pending
    }
}

struct GateEntry {
    /// Proofs expected per category (categories with none expected are absent).
    expected: BTreeMap<ProofCategory, usize>,
    gating: BTreeMap<ProofCategory, u32>,
    roster: Vec<NodeId>,
    /// `(category, verifier)` → submitters whose proof the verifier accepted.
    accepted: HashMap<(ProofCategory, NodeId), BTreeSet<NodeId>>,
    rejecters: HashMap<ProofCategory, BTreeSet<NodeId>>,
    deciding: bool,
    disposition: watch::Sender<Disposition>,
}

impl GateEntry {
    fn new(survey: &SurveyQuery) -> Self {
        let expected = required_proof_counts(survey)
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .collect();
        let thresholds: &Thresholds = &survey.thresholds;
        let gating = required_categories(survey)
            .into_iter()
            .map(|c| (c, thresholds.get(c)))
            .collect();
        let (disposition, _) = watch::channel(Disposition::Pending);
        Self {
            expected,
            gating,
            roster: survey.query.verifiers.clone(),
            accepted: HashMap::new(),
            rejecters: HashMap::new(),
            deciding: false,
            disposition,
        }
    }

    /// A verifier attests a category once it accepted every expected proof and rejected none.
    fn bitmap(&self) -> VerificationBitmap {
        self.expected
            .iter()
            .map(|(category, expected)| {
                let rejecters = self.rejecters.get(category);
                let attesting = self
                    .roster
                    .iter()
                    .filter(|vn| !rejecters.is_some_and(|r| r.contains(*vn)))
                    .filter(|vn| {
                        self.accepted
                            .get(&(*category, (*vn).clone()))
                            .is_some_and(|s| s.len() >= *expected)
                    })
                    .count();
                (*category, attesting as u32)
            })
            .collect()
    }

    fn evaluate(&self) -> (Disposition, VerificationBitmap) {
        let bitmap = self.bitmap();
        let rejecting = self.rejecters.iter().map(|(c, r)| (*c, r.len())).collect();
        (evaluate(&self.gating, self.roster.len(), &bitmap, &rejecting), bitmap)
    }

    /// Claim the right to write the terminal block, if the counts allow one.
    fn try_decide(&mut self) -> Option<(Disposition, VerificationBitmap)> {
        if self.deciding {
            return None;
        }
        let (disposition, bitmap) = self.evaluate();
        if disposition == Disposition::Pending {
            return None;
        }
        self.deciding = true;
        Some((disposition, bitmap))
    }
}

/// Snapshot of an undecided session.
#[derive(Clone, Debug)]
pub struct GateStatus {
    pub disposition: Disposition,
    pub bitmap: VerificationBitmap,
}

/// What one verdict did to its session.
enum Counted {
    /// The gate has no entry for the session.
    Unknown,
    Pending,
    Decided(Disposition, VerificationBitmap),
}

/// Tracks undecided sessions; an entry lives from `open` until its block is written.
pub struct ThresholdGate {
    ledger: Ledger,
    entries: StdMutex<HashMap<SessionId, GateEntry>>,
    opened: Notify,
    open_wait: Duration,
}

impl ThresholdGate {
    pub fn new(ledger: Ledger) -> Self {
        Self::with_open_wait(ledger, DEFAULT_SESSION_WAIT)
    }

    /// A gate that drops verdicts for a session it was not opened for within `open_wait`.
    pub fn with_open_wait(ledger: Ledger, open_wait: Duration) -> Self {
        Self {
            ledger,
            entries: StdMutex::new(HashMap::new()),
            opened: Notify::new(),
            open_wait,
        }
    }

    /// Start tracking a survey. Idempotent.
    ///
    /// Returns the disposition when the survey has nothing to prove and is decided at once.
    pub async fn open(&self, survey: &SurveyQuery) -> Result<Option<Disposition>, SurveyError> {
        let session = survey.session_id;
        if self.ledger.latest(session).await?.is_some() {
            return Ok(None);
        }
        let decision = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.contains_key(&session) {
                return Ok(None);
            }
            let mut entry = GateEntry::new(survey);
            let decision = entry.try_decide();
            tracing::info!(%session, gating = entry.gating.len(), verifiers = entry.roster.len(), "verification gate opened");
            entries.insert(session, entry);
            decision
        };
        self.opened.notify_waiters();

        match decision {
            Some((disposition, bitmap)) => {
                self.commit(session, disposition, bitmap).await?;
                Ok(Some(disposition))
            }
            None => Ok(None),
        }
    }

    fn count(&self, session: SessionId, verdict: &Verdict) -> Counted {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(&session) else {
            return Counted::Unknown;
        };
        if !entry.roster.contains(&verdict.verifier) {
            tracing::warn!(%session, verifier = %verdict.verifier, "verdict from a node outside the roster");
            return Counted::Pending;
        }
        if verdict.accepted {
            entry
                .accepted
                .entry((verdict.category, verdict.verifier.clone()))
                .or_default()
                .insert(verdict.submitter.clone());
        } else {
            entry
                .rejecters
                .entry(verdict.category)
                .or_default()
                .insert(verdict.verifier.clone());
        }
        match entry.try_decide() {
            Some((disposition, bitmap)) => Counted::Decided(disposition, bitmap),
            None => Counted::Pending,
        }
    }

    /// Count one verdict. Returns the disposition when this verdict decided the session.
    ///
    /// A verdict that overtakes the survey waits for the gate to open, up to the gate's open
    /// wait. Verdicts for decided sessions are ignored.
    pub async fn record(&self, session: SessionId, verdict: &Verdict) -> Result<Option<Disposition>, SurveyError> {
        let deadline = Instant::now() + self.open_wait;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let notified = self.opened.notified();
            match self.count(session, verdict) {
                Counted::Decided(disposition, bitmap) => {
                    self.commit(session, disposition, bitmap).await?;
                    return Ok(Some(disposition));
                }
                Counted::Pending => return Ok(None),
                Counted::Unknown => {}
            }
            if self.ledger.latest(session).await?.is_some() {
                tracing::debug!(%session, verifier = %verdict.verifier, "verdict after the decision ignored");
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SurveyError::UnknownSession(session.to_string()));
            }
            let _ = tokio::time::timeout(backoff.min(deadline - now), notified).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Write the block, then retire the entry and wake whoever waits on it.
    async fn commit(&self, session: SessionId, disposition: Disposition, bitmap: VerificationBitmap) -> Result<(), SurveyError> {
        if disposition == Disposition::Disputed {
            let err = SurveyError::ThresholdUnreachable(format!("session {session}"));
            tracing::warn!(%session, error = %err, "results are unverified");
        }
        let appended = self.ledger.append(session, &bitmap, disposition).await;

        let entry = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session);
        let block = appended?;
        if let Some(entry) = entry {
            entry.disposition.send_replace(disposition);
        }
        tracing::info!(%session, ?disposition, block = block.index, "session decided");
        Ok(())
    }

    /// Forget an undecided session without writing a block.
    pub fn abandon(&self, session: &SessionId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(session).is_some_and(|e| !e.deciding) {
            entries.remove(session);
            tracing::info!(%session, "verification abandoned");
        }
    }

    /// Current counts of an undecided session.
    pub fn status(&self, session: &SessionId) -> Option<GateStatus> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(session).map(|e| GateStatus {
            disposition: *e.disposition.borrow(),
            bitmap: e.bitmap(),
        })
    }

    /// Sessions opened and not yet decided or abandoned.
    pub fn open_sessions(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn subscribe(&self, session: &SessionId) -> Option<watch::Receiver<Disposition>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(session).map(|e| e.disposition.subscribe())
    }

    /// Wait until the session is `Verified` or `Disputed`.
    ///
    /// Decided sessions are answered from the ledger; one abandoned undecided is `UnknownSession`.
    pub async fn wait_for_verification(&self, session: &SessionId) -> Result<Disposition, SurveyError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let notified = self.opened.notified();
            if let Some(mut rx) = self.subscribe(session) {
                if let Ok(disposition) = rx.wait_for(|d| *d != Disposition::Pending).await {
                    return Ok(*disposition);
                }
                return match self.ledger.latest(*session).await? {
                    Some(block) => Ok(block.disposition),
                    None => Err(SurveyError::UnknownSession(session.to_string())),
                };
            }
            if let Some(block) = self.ledger.latest(*session).await? {
                return Ok(block.disposition);
            }
            let _ = tokio::time::timeout(backoff, notified).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}

// ---------------------------------------------------------------------------------------------
// Verifying node
// ---------------------------------------------------------------------------------------------

/// How many sessions closed ahead of their survey a verifying node remembers.
const CLOSED_MEMORY: usize = 1024;

fn is_participant(survey: &SurveyQuery, category: ProofCategory, node: &NodeId) -> bool {
    match category {
        ProofCategory::Range => survey.assignment.values().any(|dps| dps.contains(node)),
        _ => survey.computing_nodes.contains(node),
    }
}

pub struct VerifyingNode {
    id: NodeId,
    network: Network,
    sessions: SessionStore,
    proof_keys: ProofKeys,
    gate: Arc<ThresholdGate>,
    closed_early: StdMutex<VecDeque<SessionId>>,
}

impl VerifyingNode {
    pub fn new(id: NodeId, network: Network, proof_keys: ProofKeys, gate: Arc<ThresholdGate>) -> Self {
        Self {
            id,
            network,
            sessions: SessionStore::new(),
            proof_keys,
            gate,
            closed_early: StdMutex::new(VecDeque::new()),
        }
    }

    fn is_gate_for(&self, survey: &SurveyQuery) -> bool {
        survey.query.verifiers.first() == Some(&self.id)
    }

    /// Sessions this node currently holds.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn spawn(self: Arc<Self>, mut mailbox: Mailbox) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(env) = mailbox.recv().await {
                self.dispatch(env).await;
            }
        })
    }

    async fn dispatch(self: &Arc<Self>, env: Envelope) {
        let Envelope { from, session, message } = env;
        match message {
            Message::SurveyQuery(survey) => self.join(survey).await,
            Message::ProofRequest(record) => {
                let this = self.clone();
                tokio::spawn(async move { this.accept_proof(session, record).await });
            }
            Message::ProofMissing { category, reason } => {
                let this = self.clone();
                tokio::spawn(async move { this.reject_missing(session, from, category, reason).await });
            }
            Message::ProofVerdict(verdict) => {
                let this = self.clone();
                tokio::spawn(async move {
                    match this.gate.record(session, &verdict).await {
                        Ok(Some(_)) => this.close_everywhere(session).await,
                        Ok(None) => {}
                        Err(e) => tracing::error!(node = %this.id, %session, error = %e, "verdict not recorded"),
                    }
                });
            }
            Message::SessionClosed => self.close(session).await,
            other => {
                tracing::warn!(node = %self.id, %from, message = other.name(), "unexpected message for a verifying node");
            }
        }
    }

    async fn join(&self, survey: SurveyQuery) {
        let session = survey.session_id;
        if self.forget_closed(&session) {
            tracing::debug!(node = %self.id, %session, "survey closed before it arrived");
            return;
        }
        if let Err(e) = self.sessions.create(survey.clone()) {
            tracing::warn!(node = %self.id, %session, error = %e, "survey rejected");
            return;
        }
        if self.is_gate_for(&survey) {
            match self.gate.open(&survey).await {
                Ok(Some(_)) => self.close_everywhere(session).await,
                Ok(None) => {}
                Err(e) => tracing::error!(node = %self.id, %session, error = %e, "cannot open verification gate"),
            }
        }
    }

    /// Gate only: the session is decided, drop it here and on the other verifying nodes.
    async fn close_everywhere(&self, session: SessionId) {
        let Some(handle) = self.sessions.try_get(&session) else {
            return;
        };
        let verifiers = handle.lock().await.survey.query.verifiers.clone();
        for vn in verifiers.iter().filter(|vn| **vn != self.id) {
            self.network
                .send_detached(&self.id, vn, session, Message::SessionClosed);
        }
        self.sessions.remove(&session).await;
    }

    /// Closed by the gate once decided, or by the root when the survey failed.
    async fn close(&self, session: SessionId) {
        self.gate.abandon(&session);
        if self.sessions.remove(&session).await {
            tracing::debug!(node = %self.id, %session, "session closed");
        } else {
            self.remember_closed(session);
        }
    }

    fn remember_closed(&self, session: SessionId) {
        let mut closed = self.closed_early.lock().unwrap_or_else(|e| e.into_inner());
        if closed.len() == CLOSED_MEMORY {
            closed.pop_front();
        }
        closed.push_back(session);
    }

    fn forget_closed(&self, session: &SessionId) -> bool {
        let mut closed = self.closed_early.lock().unwrap_or_else(|e| e.into_inner());
        match closed.iter().position(|s| s == session) {
            Some(i) => {
                closed.remove(i);
                true
            }
            None => false,
        }
    }

    async fn accept_proof(self: Arc<Self>, session: SessionId, record: ProofRecord) {
        let handle = match self.sessions.get_within(&session).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(node = %self.id, %session, category = %record.category, error = %e, "proof dropped");
                return;
            }
        };
        let survey = handle.lock().await.survey.clone();
        let (category, submitter) = (record.category, record.node.clone());

        let this = self.clone();
        let task = tokio::spawn(async move {
            let accepted = match this.check(&survey, &record).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(node = %this.id, %session, %category, submitter = %record.node, error = %e, "proof rejected");
                    false
                }
            };
            let verdict = Verdict {
                category,
                submitter: record.node.clone(),
                verifier: this.id.clone(),
                accepted,
            };
            this.send_verdict(&survey, verdict).await;
        });
        handle.lock().await.register_proof_task(category, submitter, task);
    }

    /// A proof its submitter could not build counts as rejected.
    async fn reject_missing(self: Arc<Self>, session: SessionId, submitter: NodeId, category: ProofCategory, reason: String) {
        let survey = match self.sessions.get_within(&session).await {
            Ok(handle) => handle.lock().await.survey.clone(),
            Err(e) => {
                tracing::debug!(node = %self.id, %session, %category, error = %e, "missing proof notice dropped");
                return;
            }
        };
        if !is_participant(&survey, category, &submitter) {
            tracing::warn!(node = %self.id, %session, %submitter, "missing proof notice from a non-participant");
            return;
        }
        tracing::warn!(node = %self.id, %session, %category, %submitter, %reason, "proof missing; counted as rejected");
        let verdict = Verdict {
            category,
            submitter,
            verifier: self.id.clone(),
            accepted: false,
        };
        self.send_verdict(&survey, verdict).await;
    }

    async fn send_verdict(&self, survey: &SurveyQuery, verdict: Verdict) {
        let Some(gate_node) = survey.query.verifiers.first() else {
            return;
        };
        if let Err(e) = self
            .network
            .send(&self.id, gate_node, survey.session_id, Message::ProofVerdict(verdict))
            .await
        {
            tracing::warn!(node = %self.id, session = %survey.session_id, error = %e, "verdict not delivered");
        }
    }

    /// Verify one proof record against the survey it claims to belong to.
    pub async fn check(&self, survey: &SurveyQuery, record: &ProofRecord) -> Result<(), SurveyError> {
        if record.payload.category() != record.category {
            return Err(SurveyError::Internal("payload does not match its category".into()));
        }
        if !is_participant(survey, record.category, &record.node) {
            return Err(SurveyError::Internal(format!("{} is not a participant", record.node)));
        }

        let keys = match record.category {
            ProofCategory::Range => Some(self.proof_keys.ensure().await?),
            _ => None,
        };
        let survey = survey.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let groups = survey.query.group_keys();
            let aggregation_inputs =
                survey.providers_of(&record.node).len() + children(&survey.computing_nodes, &record.node).len();
            let ctx = VerifyContext {
                range_vk: keys.as_ref().map(|k| &k.vk),
                range_pvk: keys
                    .as_ref()
                    .filter(|_| survey.query.proofs == ProofMode::Optimized)
                    .map(|k| &k.pvk),
                bounds: &survey.query.ranges,
                joint_key: &survey.joint_key,
                querier_key: &survey.querier_key,
                submitter_key: survey.node_keys.get(&record.node),
                groups: &groups,
                aggregation_inputs,
            };
            record.payload.verify(&ctx)
        })
        .await??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationSpec, Query};
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use survey_zk::elgamal::KeyPair;
    use survey_zk::types::RangeBound;
    use uuid::Uuid;

    const SETTLE: Duration = Duration::from_secs(5);

    fn vns(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("vn-{i}"))).collect()
    }

    fn survey(verifiers: Vec<NodeId>, thresholds: Thresholds) -> SurveyQuery {
        let kp = KeyPair::generate(&mut ChaCha20Rng::seed_from_u64(9));
        let mut query = Query::new(OperationSpec::named("sum"), vec!["0".into()]);
        query.proofs = ProofMode::Plain;
        query.ranges = vec![RangeBound::UNCHECKED];
        query.verifiers = verifiers;
        SurveyQuery {
            session_id: Uuid::new_v4(),
            query,
            computing_nodes: vec![NodeId::new("cn-0"), NodeId::new("cn-1")],
            assignment: BTreeMap::new(),
            node_keys: BTreeMap::new(),
            joint_key: kp.public,
            querier_key: kp.public,
            thresholds,
            intra_message: true,
        }
    }

    fn verdict(category: ProofCategory, submitter: &str, verifier: &NodeId, accepted: bool) -> Verdict {
        Verdict {
            category,
            submitter: NodeId::new(submitter),
            verifier: verifier.clone(),
            accepted,
        }
    }

    async fn gate() -> ThresholdGate {
        ThresholdGate::new(Ledger::new(db::connect_in_memory().await.unwrap()))
    }

    /// A running gate node `vn-0` with `vn-1` as a silent peer whose inbox the test reads.
    async fn gate_node(net: &Network) -> (Arc<VerifyingNode>, Arc<ThresholdGate>, Mailbox, JoinHandle<()>) {
        let roster = vns(2);
        let gate = Arc::new(gate().await);
        let node = Arc::new(VerifyingNode::new(roster[0].clone(), net.clone(), ProofKeys::default(), gate.clone()));
        let task = node.clone().spawn(net.register(roster[0].clone()));
        let peer = net.register(roster[1].clone());
        (node, gate, peer, task)
    }

    async fn settled(what: impl Fn() -> bool) {
        tokio::time::timeout(SETTLE, async {
            while !what() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn threshold_law() {
        let gating = BTreeMap::from([(ProofCategory::Aggregation, 2u32)]);
        let none = BTreeMap::new();
        let one = VerificationBitmap::from([(ProofCategory::Aggregation, 1)]);
        let two = VerificationBitmap::from([(ProofCategory::Aggregation, 2)]);

        assert_eq!(evaluate(&gating, 3, &one, &none), Disposition::Pending);
        assert_eq!(evaluate(&gating, 3, &two, &none), Disposition::Verified);
        let rejected_twice = BTreeMap::from([(ProofCategory::Aggregation, 2)]);
        assert_eq!(evaluate(&gating, 3, &one, &rejected_twice), Disposition::Disputed);
        assert_eq!(evaluate(&BTreeMap::new(), 3, &VerificationBitmap::new(), &none), Disposition::Verified);
    }

    #[tokio::test]
    async fn verified_only_after_threshold_attestations() {
        let gate = gate().await;
        let roster = vns(3);
        let s = survey(roster.clone(), Thresholds { aggregation: 2, ..Default::default() });
        assert_eq!(gate.open(&s).await.unwrap(), None);
        let id = s.session_id;

        // One verifier accepting both proofs is one attestation.
        for cn in ["cn-0", "cn-1"] {
            let d = gate.record(id, &verdict(ProofCategory::Aggregation, cn, &roster[0], true)).await.unwrap();
            assert_eq!(d, None);
        }
        // A second verifier with only half the proofs does not attest yet.
        let d = gate.record(id, &verdict(ProofCategory::Aggregation, "cn-0", &roster[1], true)).await.unwrap();
        assert_eq!(d, None);
        assert_eq!(gate.status(&id).unwrap().bitmap[&ProofCategory::Aggregation], 1);
        assert!(gate.ledger().latest(id).await.unwrap().is_none());

        let d = gate.record(id, &verdict(ProofCategory::Aggregation, "cn-1", &roster[1], true)).await.unwrap();
        assert_eq!(d, Some(Disposition::Verified));
        assert_eq!(gate.wait_for_verification(&id).await.unwrap(), Disposition::Verified);

        let block = gate.ledger().latest(id).await.unwrap().unwrap();
        assert_eq!(block.disposition, Disposition::Verified);
        assert_eq!(block.bitmap[&ProofCategory::Aggregation], 2);
    }

    #[tokio::test]
    async fn decided_sessions_are_pruned() {
        let gate = gate().await;
        let roster = vns(2);
        let s = survey(roster.clone(), Thresholds { aggregation: 1, ..Default::default() });
        gate.open(&s).await.unwrap();
        let id = s.session_id;
        for cn in ["cn-0", "cn-1"] {
            gate.record(id, &verdict(ProofCategory::Aggregation, cn, &roster[0], true)).await.unwrap();
        }
        assert_eq!(gate.open_sessions(), 0);
        assert!(gate.status(&id).is_none());

        // Late verdicts and a repeated opening neither wait nor write another block.
        let late_verdict = verdict(ProofCategory::Aggregation, "cn-0", &roster[1], false);
        let late = gate.record(id, &late_verdict);
        assert_eq!(tokio::time::timeout(SETTLE, late).await.unwrap().unwrap(), None);
        assert_eq!(gate.open(&s).await.unwrap(), None);
        assert_eq!(gate.open_sessions(), 0);
        assert_eq!(db::list_blocks(gate.ledger().db(), 0, 10).await.unwrap().len(), 1);
        assert_eq!(gate.wait_for_verification(&id).await.unwrap(), Disposition::Verified);
    }

    #[tokio::test]
    async fn disputed_once_threshold_is_unreachable() {
        let gate = gate().await;
        let roster = vns(3);
        let s = survey(roster.clone(), Thresholds { key_switch: 2, ..Default::default() });
        gate.open(&s).await.unwrap();
        let id = s.session_id;

        let d = gate.record(id, &verdict(ProofCategory::KeySwitch, "cn-0", &roster[0], false)).await.unwrap();
        assert_eq!(d, None);
        let d = gate.record(id, &verdict(ProofCategory::KeySwitch, "cn-1", &roster[1], false)).await.unwrap();
        assert_eq!(d, Some(Disposition::Disputed));

        let block = gate.ledger().latest(id).await.unwrap().unwrap();
        assert_eq!(block.disposition, Disposition::Disputed);
    }

    #[tokio::test]
    async fn verdicts_may_arrive_before_the_gate_opens() {
        let gate = Arc::new(gate().await);
        let roster = vns(1);
        let s = survey(roster.clone(), Thresholds { aggregation: 1, ..Default::default() });
        let id = s.session_id;

        let early = {
            let (gate, v) = (gate.clone(), verdict(ProofCategory::Aggregation, "cn-0", &roster[0], true));
            tokio::spawn(async move { gate.record(id, &v).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!early.is_finished());

        gate.open(&s).await.unwrap();
        assert_eq!(early.await.unwrap().unwrap(), None);
        let d = gate.record(id, &verdict(ProofCategory::Aggregation, "cn-1", &roster[0], true)).await.unwrap();
        assert_eq!(d, Some(Disposition::Verified));
    }

    #[tokio::test]
    async fn verdicts_for_sessions_never_opened_give_up() {
        let ledger = Ledger::new(db::connect_in_memory().await.unwrap());
        let gate = ThresholdGate::with_open_wait(ledger, Duration::from_millis(50));
        let err = gate
            .record(Uuid::new_v4(), &verdict(ProofCategory::Aggregation, "cn-0", &vns(1)[0], true))
            .await
            .unwrap_err();
        assert!(matches!(err, SurveyError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn verdicts_from_outside_the_roster_are_ignored() {
        let gate = gate().await;
        let roster = vns(1);
        let s = survey(roster, Thresholds { aggregation: 1, ..Default::default() });
        gate.open(&s).await.unwrap();
        let stranger = NodeId::new("mallory");
        for cn in ["cn-0", "cn-1"] {
            let d = gate
                .record(s.session_id, &verdict(ProofCategory::Aggregation, cn, &stranger, true))
                .await
                .unwrap();
            assert_eq!(d, None);
        }
        assert_eq!(gate.status(&s.session_id).unwrap().disposition, Disposition::Pending);
    }

    #[tokio::test]
    async fn nothing_to_gate_is_verified_at_once() {
        let gate = gate().await;
        let s = survey(vns(2), Thresholds::default());
        assert_eq!(gate.open(&s).await.unwrap(), Some(Disposition::Verified));
        assert_eq!(gate.wait_for_verification(&s.session_id).await.unwrap(), Disposition::Verified);
    }

    #[tokio::test]
    async fn slow_peer_verdicts_complete_the_threshold() {
        let net = Network::new(32);
        let (node, gate, mut peer, _task) = gate_node(&net).await;
        let roster = vns(2);
        let root = NodeId::new("cn-0");
        let s = survey(roster.clone(), Thresholds { aggregation: 2, key_switch: 1, ..Default::default() });
        let id = s.session_id;
        net.send(&root, &roster[0], id, Message::SurveyQuery(s)).await.unwrap();

        for category in [ProofCategory::Aggregation, ProofCategory::KeySwitch] {
            for cn in ["cn-0", "cn-1"] {
                let v = verdict(category, cn, &roster[0], true);
                net.send(&roster[0], &roster[0], id, Message::ProofVerdict(v)).await.unwrap();
            }
        }
        // The gate node has seen every proof it expects; only the peer is missing.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(gate.ledger().latest(id).await.unwrap().is_none());
        assert_eq!(gate.status(&id).unwrap().bitmap[&ProofCategory::KeySwitch], 1);

        for cn in ["cn-0", "cn-1"] {
            let v = verdict(ProofCategory::Aggregation, cn, &roster[1], true);
            net.send(&roster[1], &roster[0], id, Message::ProofVerdict(v)).await.unwrap();
        }
        let disposition = tokio::time::timeout(SETTLE, gate.wait_for_verification(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(disposition, Disposition::Verified);
        let block = gate.ledger().latest(id).await.unwrap().unwrap();
        assert_eq!(block.bitmap[&ProofCategory::Aggregation], 2);

        // The decision closes the session on the gate node and on its peer.
        let closed = tokio::time::timeout(SETTLE, peer.recv()).await.unwrap().unwrap();
        assert!(matches!(closed.message, Message::SessionClosed));
        settled(|| node.session_count() == 0).await;
        assert_eq!(gate.open_sessions(), 0);
    }

    #[tokio::test]
    async fn missing_proofs_count_as_rejections() {
        let net = Network::new(32);
        let (node, gate, _peer, _task) = gate_node(&net).await;
        let roster = vns(1);
        let cn = NodeId::new("cn-1");
        let s = survey(roster.clone(), Thresholds { key_switch: 1, ..Default::default() });
        let id = s.session_id;
        net.send(&cn, &roster[0], id, Message::SurveyQuery(s)).await.unwrap();

        let missing = Message::ProofMissing {
            category: ProofCategory::KeySwitch,
            reason: "value out of range".into(),
        };
        net.send(&cn, &roster[0], id, missing).await.unwrap();

        let disposition = tokio::time::timeout(SETTLE, gate.wait_for_verification(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(disposition, Disposition::Disputed);
        settled(|| node.session_count() == 0).await;
    }

    #[tokio::test]
    async fn failed_surveys_are_abandoned_without_a_block() {
        let net = Network::new(32);
        let (node, gate, _peer, _task) = gate_node(&net).await;
        let root = NodeId::new("cn-0");
        let s = survey(vns(2), Thresholds { aggregation: 1, ..Default::default() });
        let id = s.session_id;

        net.send(&root, &vns(1)[0], id, Message::SurveyQuery(s)).await.unwrap();
        settled(|| gate.open_sessions() == 1).await;
        net.send(&root, &vns(1)[0], id, Message::SessionClosed).await.unwrap();

        settled(|| gate.open_sessions() == 0 && node.session_count() == 0).await;
        assert!(gate.ledger().latest(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_survey_closed_before_it_arrives_is_ignored() {
        let net = Network::new(32);
        let (node, gate, _peer, _task) = gate_node(&net).await;
        let from = NodeId::new("vn-9");
        let s = survey(vns(2), Thresholds { aggregation: 1, ..Default::default() });
        let id = s.session_id;

        net.send(&from, &vns(1)[0], id, Message::SessionClosed).await.unwrap();
        net.send(&from, &vns(1)[0], id, Message::SurveyQuery(s)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.session_count(), 0);
        assert_eq!(gate.open_sessions(), 0);
    }
}
