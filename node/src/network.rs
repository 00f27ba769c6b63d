//! In-process peer network.
//!
//! Every node owns one bounded inbox. Messages are a tagged union; replies to an outstanding
//! request are routed by `(session, protocol kind)` to whichever task registered to collect
//! them, everything else goes to the node's own handler for that variant.

use crate::errors::SurveyError;
use crate::models::{GroupKey, GroupedResponse, NodeId, SessionId, SurveyQuery};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use survey_zk::elgamal::{CipherVector, KeySwitchShare};
use survey_zk::proofs::{ProofCategory, ProofPayload};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Survey,
    DataCollection,
    Dro,
    Aggregation,
    Obfuscation,
    KeySwitch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProofRecord {
    pub category: ProofCategory,
    pub node: NodeId,
    pub payload: ProofPayload,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub category: ProofCategory,
    pub submitter: NodeId,
    pub verifier: NodeId,
    pub accepted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    /// Client → root, root → other computing and verifying nodes.
    SurveyQuery(SurveyQuery),
    /// Root → client: per-group ciphertexts under the querier key.
    SurveyResult(Result<GroupedResponse, String>),
    /// Computing node → its data providers.
    Announce(SurveyQuery),
    DpResponse(GroupedResponse),
    DroRequest(CipherVector),
    DroReply(CipherVector),
    AggregationRequest,
    AggregationReply(GroupedResponse),
    ObfuscationRequest(GroupedResponse),
    ObfuscationReply(GroupedResponse),
    KeySwitchRequest(GroupedResponse),
    KeySwitchReply(BTreeMap<GroupKey, Vec<KeySwitchShare>>),
    /// A phase could not complete in this subtree.
    PhaseFailed { kind: ProtocolKind, reason: String },
    ProofRequest(ProofRecord),
    /// Submitter → verifying nodes: the proof could not be built.
    ProofMissing { category: ProofCategory, reason: String },
    ProofVerdict(Verdict),
    /// Root → every other participant when a survey fails; gate → its peers once decided.
    SessionClosed,
}

impl Message {
    /// Protocol a reply belongs to; `None` for messages that start work.
    pub fn reply_kind(&self) -> Option<ProtocolKind> {
        match self {
            Message::SurveyResult(_) => Some(ProtocolKind::Survey),
            Message::DpResponse(_) => Some(ProtocolKind::DataCollection),
            Message::DroReply(_) => Some(ProtocolKind::Dro),
            Message::AggregationReply(_) => Some(ProtocolKind::Aggregation),
            Message::ObfuscationReply(_) => Some(ProtocolKind::Obfuscation),
            Message::KeySwitchReply(_) => Some(ProtocolKind::KeySwitch),
            Message::PhaseFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::SurveyQuery(_) => "survey_query",
            Message::SurveyResult(_) => "survey_result",
            Message::Announce(_) => "announce",
            Message::DpResponse(_) => "dp_response",
            Message::DroRequest(_) => "dro_request",
            Message::DroReply(_) => "dro_reply",
            Message::AggregationRequest => "aggregation_request",
            Message::AggregationReply(_) => "aggregation_reply",
            Message::ObfuscationRequest(_) => "obfuscation_request",
            Message::ObfuscationReply(_) => "obfuscation_reply",
            Message::KeySwitchRequest(_) => "key_switch_request",
            Message::KeySwitchReply(_) => "key_switch_reply",
            Message::PhaseFailed { .. } => "phase_failed",
            Message::ProofRequest(_) => "proof_request",
            Message::ProofMissing { .. } => "proof_missing",
            Message::ProofVerdict(_) => "proof_verdict",
            Message::SessionClosed => "session_closed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub session: SessionId,
    pub message: Message,
}

pub type Mailbox = mpsc::Receiver<Envelope>;

#[derive(Clone)]
pub struct Network {
    peers: Arc<RwLock<HashMap<NodeId, mpsc::Sender<Envelope>>>>,
    capacity: usize,
}

impl Network {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a node and hand back its inbox.
    pub fn register(&self, id: NodeId) -> Mailbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: &NodeId) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    fn sender(&self, to: &NodeId) -> Result<mpsc::Sender<Envelope>, SurveyError> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(to)
            .cloned()
            .ok_or_else(|| SurveyError::Transport(format!("unknown peer {to}")))
    }

    pub async fn send(&self, from: &NodeId, to: &NodeId, session: SessionId, message: Message) -> Result<(), SurveyError> {
        let tx = self.sender(to)?;
        tracing::trace!(%from, %to, %session, message = message.name(), "send");
        tx.send(Envelope {
            from: from.clone(),
            session,
            message,
        })
        .await
        .map_err(|_| SurveyError::Transport(format!("peer {to} is gone")))
    }

    /// Fire-and-forget; delivery failures are logged.
    pub fn send_detached(&self, from: &NodeId, to: &NodeId, session: SessionId, message: Message) {
        let (net, from, to) = (self.clone(), from.clone(), to.clone());
        tokio::spawn(async move {
            if let Err(e) = net.send(&from, &to, session, message).await {
                tracing::warn!(%from, %to, %session, error = %e, "detached send failed");
            }
        });
    }
}

type RouteKey = (SessionId, ProtocolKind);

/// Routes replies to the task waiting for them.
#[derive(Default)]
pub struct ReplyRouter {
    waiting: StdMutex<HashMap<RouteKey, mpsc::Sender<Envelope>>>,
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting `expected` replies. Register before sending the requests.
    pub fn expect(self: &Arc<Self>, session: SessionId, kind: ProtocolKind, expected: usize) -> Collector {
        let (tx, rx) = mpsc::channel(expected.max(1));
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((session, kind), tx);
        Collector {
            router: self.clone(),
            key: (session, kind),
            rx,
            expected,
        }
    }

    /// Hand the envelope to its collector; gives it back if nobody is waiting.
    pub fn route(&self, envelope: Envelope) -> Result<(), Envelope> {
        let Some(kind) = envelope.message.reply_kind() else {
            return Err(envelope);
        };
        let tx = self
            .waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(envelope.session, kind))
            .cloned();
        match tx {
            Some(tx) => tx.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(env) | mpsc::error::TrySendError::Closed(env) => env,
            }),
            None => Err(envelope),
        }
    }

    /// Close every collector of `session`; their `collect` fails.
    pub fn cancel(&self, session: SessionId) {
        self.waiting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(s, _), _| *s != session);
    }

    fn release(&self, key: &RouteKey) {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

pub struct Collector {
    router: Arc<ReplyRouter>,
    key: RouteKey,
    rx: mpsc::Receiver<Envelope>,
    expected: usize,
}

impl Collector {
    /// Wait for every expected reply. A `PhaseFailed` from any peer fails the whole phase.
    pub async fn collect(mut self) -> Result<Vec<Envelope>, SurveyError> {
        let mut out = Vec::with_capacity(self.expected);
        while out.len() < self.expected {
            let env = self
                .rx
                .recv()
                .await
                .ok_or_else(|| SurveyError::Transport("reply channel closed".into()))?;
            if let Message::PhaseFailed { reason, .. } = &env.message {
                return Err(SurveyError::Internal(format!("{} failed: {reason}", env.from)));
            }
            out.push(env);
        }
        Ok(out)
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.router.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn replies_reach_the_registered_collector() {
        let net = Network::new(4);
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let mut inbox = net.register(a.clone());
        net.register(b.clone());

        let router = Arc::new(ReplyRouter::new());
        let session = Uuid::new_v4();
        let collector = router.expect(session, ProtocolKind::Aggregation, 1);

        net.send(&b, &a, session, Message::AggregationReply(GroupedResponse::new()))
            .await
            .unwrap();
        let env = inbox.recv().await.unwrap();
        assert!(router.route(env).is_ok());

        let got = collector.collect().await.unwrap();
        assert_eq!(got[0].from, b);

        // Collector dropped: further replies are handed back.
        let stray = Envelope {
            from: b,
            session,
            message: Message::AggregationReply(GroupedResponse::new()),
        };
        assert!(router.route(stray).is_err());
    }

    #[tokio::test]
    async fn phase_failure_fails_the_collection() {
        let router = Arc::new(ReplyRouter::new());
        let session = Uuid::new_v4();
        let collector = router.expect(session, ProtocolKind::KeySwitch, 2);
        router
            .route(Envelope {
                from: NodeId::new("cn-1"),
                session,
                message: Message::PhaseFailed {
                    kind: ProtocolKind::KeySwitch,
                    reason: "boom".into(),
                },
            })
            .unwrap();
        assert!(collector.collect().await.is_err());
    }

    #[tokio::test]
    async fn cancelled_sessions_fail_their_collectors() {
        let router = Arc::new(ReplyRouter::new());
        let (session, other) = (Uuid::new_v4(), Uuid::new_v4());
        let aggregation = router.expect(session, ProtocolKind::Aggregation, 1);
        let key_switch = router.expect(session, ProtocolKind::KeySwitch, 1);
        let untouched = router.expect(other, ProtocolKind::Aggregation, 1);

        router.cancel(session);
        assert!(matches!(aggregation.collect().await, Err(SurveyError::Transport(_))));
        assert!(matches!(key_switch.collect().await, Err(SurveyError::Transport(_))));

        router
            .route(Envelope {
                from: NodeId::new("cn-1"),
                session: other,
                message: Message::AggregationReply(GroupedResponse::new()),
            })
            .unwrap();
        assert_eq!(untouched.collect().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_peers_are_transport_errors() {
        let net = Network::new(1);
        let err = net
            .send(&NodeId::new("a"), &NodeId::new("nobody"), Uuid::nil(), Message::AggregationRequest)
            .await;
        assert!(matches!(err, Err(SurveyError::Transport(_))));
    }
}
