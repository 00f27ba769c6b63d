//! Protocol roles and the shared plumbing they run on.

pub mod data_collection;
pub mod tree;

use crate::errors::SurveyError;
use crate::models::{NodeId, SessionId, SurveyQuery};
use crate::network::{Message, Network, ProofRecord, ProtocolKind, ReplyRouter};
use crate::session::SessionStore;
use std::future::Future;
use std::sync::Arc;
use survey_zk::elgamal::KeyPair;
use survey_zk::proofs::{ProofCategory, ProofPayload};
use tokio::task::JoinHandle;

/// Everything a computing node's handlers share.
pub struct NodeContext {
    pub id: NodeId,
    pub keys: KeyPair,
    pub network: Network,
    pub sessions: SessionStore,
    pub replies: Arc<ReplyRouter>,
}

impl NodeContext {
    pub fn new(id: NodeId, keys: KeyPair, network: Network) -> Self {
        Self {
            id,
            keys,
            network,
            sessions: SessionStore::new(),
            replies: Arc::new(ReplyRouter::new()),
        }
    }

    /// Tell `to` that a phase could not complete here.
    pub(crate) fn report_failure(&self, to: &NodeId, session: SessionId, kind: ProtocolKind, err: &SurveyError) {
        tracing::warn!(node = %self.id, %session, ?kind, error = %err, "phase failed");
        self.network.send_detached(
            &self.id,
            to,
            session,
            Message::PhaseFailed {
                kind,
                reason: err.to_string(),
            },
        );
    }
}

// ---------------------------------------------------------------------------------------------
// Tree over the computing node roster: node `i` has children `2i+1` and `2i+2`.
// ---------------------------------------------------------------------------------------------

pub fn position(roster: &[NodeId], id: &NodeId) -> Option<usize> {
    roster.iter().position(|n| n == id)
}

pub fn children(roster: &[NodeId], id: &NodeId) -> Vec<NodeId> {
    let Some(i) = position(roster, id) else {
        return Vec::new();
    };
    [2 * i + 1, 2 * i + 2]
        .into_iter()
        .filter_map(|c| roster.get(c).cloned())
        .collect()
}

/// Pre-order traversal from the root.
pub fn traversal(roster: &[NodeId]) -> Vec<NodeId> {
    fn visit(roster: &[NodeId], i: usize, out: &mut Vec<NodeId>) {
        if let Some(n) = roster.get(i) {
            out.push(n.clone());
            visit(roster, 2 * i + 1, out);
            visit(roster, 2 * i + 2, out);
        }
    }
    let mut out = Vec::with_capacity(roster.len());
    visit(roster, 0, &mut out);
    out
}

/// Successor of `id` in the traversal, if any.
pub fn next_in_traversal(roster: &[NodeId], id: &NodeId) -> Option<NodeId> {
    let order = traversal(roster);
    let i = order.iter().position(|n| n == id)?;
    order.get(i + 1).cloned()
}

// ---------------------------------------------------------------------------------------------
// Proof submission
// ---------------------------------------------------------------------------------------------

/// Build a proof off the data path and send it to every verifying node.
///
/// The data path never waits on this task. A proof that cannot be built is announced as
/// missing so the verifiers count it against the submitter.
pub(crate) fn spawn_proof<F>(
    network: Network,
    submitter: NodeId,
    survey: &SurveyQuery,
    category: ProofCategory,
    build: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<ProofPayload, SurveyError>> + Send + 'static,
{
    let session = survey.session_id;
    let verifiers = survey.query.verifiers.clone();
    tokio::spawn(async move {
        let message = match build.await {
            Ok(payload) => Message::ProofRequest(ProofRecord {
                category,
                node: submitter.clone(),
                payload,
            }),
            Err(e) => {
                tracing::warn!(%session, node = %submitter, %category, error = %e, "proof generation failed");
                Message::ProofMissing {
                    category,
                    reason: e.to_string(),
                }
            }
        };
        for vn in &verifiers {
            if let Err(e) = network.send(&submitter, vn, session, message.clone()).await {
                tracing::warn!(%session, node = %submitter, verifier = %vn, error = %e, "proof not delivered");
            }
        }
        tracing::debug!(%session, node = %submitter, %category, message = message.name(), "proof submitted");
    })
}

/// Submit a computing node's proof and track the task on its session.
pub(crate) async fn submit_proof<F>(ctx: &NodeContext, survey: &SurveyQuery, category: ProofCategory, build: F)
where
    F: FnOnce() -> Result<ProofPayload, SurveyError> + Send + 'static,
{
    if !survey.proofs_enabled() {
        return;
    }
    let handle = spawn_proof(ctx.network.clone(), ctx.id.clone(), survey, category, async move {
        tokio::task::spawn_blocking(build).await?
    });
    let node = ctx.id.clone();
    if let Err(e) = ctx
        .sessions
        .mutate(&survey.session_id, |s| s.register_proof_task(category, node, handle))
        .await
    {
        tracing::debug!(node = %ctx.id, session = %survey.session_id, %category, error = %e, "proof task left untracked");
    }
}

/// Wait for this node's proof tasks, then drop the session.
pub(crate) async fn finish_session(ctx: &NodeContext, survey: &SurveyQuery) {
    let id = survey.session_id;
    let Some(handle) = ctx.sessions.try_get(&id) else {
        return;
    };
    let tasks = handle.lock().await.take_proof_tasks();
    for task in tasks {
        let _ = task.await;
    }
    ctx.sessions.remove(&id).await;
}

/// Abandon a failed session: pending phases stop waiting and proof tasks are aborted.
pub(crate) async fn close_session(ctx: &NodeContext, session: SessionId) {
    ctx.replies.cancel(session);
    if ctx.sessions.remove(&session).await {
        tracing::info!(node = %ctx.id, %session, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("cn-{i}"))).collect()
    }

    #[test]
    fn binary_tree_shape() {
        let r = roster(5);
        assert_eq!(children(&r, &r[0]), vec![r[1].clone(), r[2].clone()]);
        assert_eq!(children(&r, &r[1]), vec![r[3].clone(), r[4].clone()]);
        assert!(children(&r, &r[2]).is_empty());
        assert!(children(&r, &NodeId::new("stranger")).is_empty());
    }

    #[test]
    fn traversal_is_preorder() {
        let r = roster(5);
        let names: Vec<_> = traversal(&r).into_iter().map(|n| n.0).collect();
        assert_eq!(names, ["cn-0", "cn-1", "cn-3", "cn-4", "cn-2"]);
        assert_eq!(next_in_traversal(&r, &r[4]), Some(r[2].clone()));
        assert_eq!(next_in_traversal(&r, &r[2]), None);
    }

    #[tokio::test]
    async fn closing_a_session_releases_its_waiters() {
        use crate::models::{OperationSpec, Query, Thresholds};
        use rand::SeedableRng;
        use rand_chacha::ChaCha20Rng;
        use std::collections::BTreeMap;

        let keys = KeyPair::generate(&mut ChaCha20Rng::seed_from_u64(3));
        let ctx = NodeContext::new(NodeId::new("cn-1"), keys.clone(), Network::new(8));
        let survey = SurveyQuery {
            session_id: uuid::Uuid::new_v4(),
            query: Query::new(OperationSpec::named("sum"), vec!["0".into()]),
            computing_nodes: roster(2),
            assignment: BTreeMap::new(),
            node_keys: BTreeMap::new(),
            joint_key: keys.public,
            querier_key: keys.public,
            thresholds: Thresholds::default(),
            intra_message: true,
        };
        let session = survey.session_id;
        ctx.sessions.create(survey).unwrap();
        let collector = ctx.replies.expect(session, ProtocolKind::Aggregation, 1);

        close_session(&ctx, session).await;
        assert!(ctx.sessions.is_empty());
        assert!(collector.collect().await.is_err());
        // A second close is harmless.
        close_session(&ctx, session).await;
    }
}
