//! The querier: builds survey queries and decrypts what comes back.

use crate::errors::SurveyError;
use crate::models::{GroupKey, GroupedResponse, NodeId, Query, SurveyQuery, Thresholds, Topology};
use crate::network::{Message, Network, ProtocolKind, ReplyRouter};
use crate::operations::operation_for;
use crate::validation::validate;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use survey_zk::elgamal::{decrypt_check_zero, DecryptionTable, KeyPair, PublicKey};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Decoded result per group.
pub type SurveyResults = BTreeMap<GroupKey, Vec<f64>>;

pub struct Client {
    id: NodeId,
    keys: KeyPair,
    network: Network,
    replies: Arc<ReplyRouter>,
    table: Arc<DecryptionTable>,
    inbox: JoinHandle<()>,
}

impl Client {
    /// Join the network and build the decryption table for `[-limit, limit]`.
    pub async fn connect(id: NodeId, network: Network, decryption_limit: i64) -> Result<Self, SurveyError> {
        let table = tokio::task::spawn_blocking(move || DecryptionTable::new(decryption_limit)).await?;
        let replies = Arc::new(ReplyRouter::new());
        let mut mailbox = network.register(id.clone());

        let inbox = {
            let (replies, id) = (replies.clone(), id.clone());
            tokio::spawn(async move {
                while let Some(env) = mailbox.recv().await {
                    if let Err(env) = replies.route(env) {
                        tracing::debug!(client = %id, session = %env.session, message = env.message.name(), "unsolicited message dropped");
                    }
                }
            })
        };

        Ok(Self {
            id,
            keys: KeyPair::generate(&mut OsRng),
            network,
            replies,
            table: Arc::new(table),
            inbox,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public
    }

    /// Attach a fresh session id, the topology and this client's key to `query`.
    ///
    /// With proofs on and no verifier roster given, every verifying node of the topology is used.
    pub fn generate_survey_query(&self, topology: &Topology, mut query: Query, thresholds: Thresholds) -> SurveyQuery {
        if query.proofs.enabled() && query.verifiers.is_empty() {
            query.verifiers = topology.verifying_nodes.clone();
        }
        SurveyQuery {
            session_id: Uuid::new_v4(),
            query,
            computing_nodes: topology.computing_nodes.clone(),
            assignment: topology.data_providers.clone(),
            node_keys: topology.node_keys.clone(),
            joint_key: topology.joint_key,
            querier_key: self.keys.public,
            thresholds,
            intra_message: false,
        }
    }

    /// Submit to `entry` (the root) and wait for the decoded result.
    pub async fn send_survey_query(&self, entry: &NodeId, survey: SurveyQuery) -> Result<SurveyResults, SurveyError> {
        validate(&survey, survey.query.diffp.enabled()).into_result()?;
        let session = survey.session_id;
        let query = survey.query.clone();

        let collector = self.replies.expect(session, ProtocolKind::Survey, 1);
        self.network
            .send(&self.id, entry, session, Message::SurveyQuery(survey))
            .await?;
        tracing::info!(client = %self.id, %session, %entry, "survey submitted");

        let reply = collector
            .collect()
            .await?
            .pop()
            .ok_or_else(|| SurveyError::Transport("no result".into()))?;
        match reply.message {
            Message::SurveyResult(Ok(result)) => self.decode(&query, &result),
            Message::SurveyResult(Err(reason)) => Err(SurveyError::Internal(reason)),
            other => Err(SurveyError::Internal(format!("unexpected {}", other.name()))),
        }
    }

    /// Decrypt under the querier key and decode each group through the operator.
    pub fn decode(&self, query: &Query, result: &GroupedResponse) -> Result<SurveyResults, SurveyError> {
        let op = operation_for(&query.operation)?;
        result
            .iter()
            .map(|(group, v)| -> Result<(GroupKey, Vec<f64>), SurveyError> {
                let plain: Vec<i64> = if op.zero_test_only() {
                    v.iter()
                        .map(|ct| i64::from(!decrypt_check_zero(&self.keys.secret, ct)))
                        .collect()
                } else {
                    self.table.decrypt_int_vector(&self.keys.secret, v)?
                };
                Ok((group.clone(), op.decode_aggregate(&plain)?))
            })
            .collect()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inbox.abort();
        self.network.unregister(&self.id);
    }
}
