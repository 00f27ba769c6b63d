//! Data collection: a computing node announces the survey to its providers and sums what
//! comes back.

use super::{spawn_proof, NodeContext};
use crate::errors::SurveyError;
use crate::models::{GroupKey, GroupedResponse, NodeId, SessionId, SurveyQuery};
use crate::network::{Envelope, Mailbox, Message, Network, ProtocolKind};
use crate::operations::{operation_for, Columns};
use crate::provider::{DataLoader, Neutralizer};
use crate::session::Collected;
use crate::state::ProofKeys;
use rand::rngs::OsRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use survey_zk::elgamal::{encrypt_int_vector, CipherVector, Ciphertext};
use survey_zk::proofs::{ProofCategory, ProofPayload, RangeProofSet};
use tokio::task::JoinHandle;

/// Plaintext contribution of one provider, per group.
pub type LocalValues = BTreeMap<GroupKey, Vec<i64>>;

pub struct DataProvider {
    id: NodeId,
    network: Network,
    loader: Arc<dyn DataLoader>,
    neutralizer: Arc<dyn Neutralizer>,
    proof_keys: ProofKeys,
    proof_tasks: StdMutex<HashMap<SessionId, JoinHandle<()>>>,
}

impl DataProvider {
    pub fn new(
        id: NodeId,
        network: Network,
        loader: Arc<dyn DataLoader>,
        neutralizer: Arc<dyn Neutralizer>,
        proof_keys: ProofKeys,
    ) -> Self {
        Self {
            id,
            network,
            loader,
            neutralizer,
            proof_keys,
            proof_tasks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>, mut mailbox: Mailbox) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(env) = mailbox.recv().await {
                match env.message {
                    Message::Announce(survey) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.answer(env.from, survey).await });
                    }
                    other => {
                        tracing::warn!(node = %self.id, message = other.name(), "unexpected message for a data provider");
                    }
                }
            }
        })
    }

    async fn answer(&self, cn: NodeId, survey: SurveyQuery) {
        let session = survey.session_id;
        let response = match self.respond(&survey).await {
            Ok(r) => Message::DpResponse(r),
            Err(e) => {
                tracing::warn!(node = %self.id, %session, error = %e, "cannot answer survey");
                Message::PhaseFailed {
                    kind: ProtocolKind::DataCollection,
                    reason: e.to_string(),
                }
            }
        };
        if let Err(e) = self.network.send(&self.id, &cn, session, response).await {
            tracing::warn!(node = %self.id, %session, error = %e, "response not delivered");
        }
    }

    /// Encode, encrypt and replicate; range proofs go out on their own task.
    pub async fn respond(&self, survey: &SurveyQuery) -> Result<GroupedResponse, SurveyError> {
        let values = self.local_values(survey)?;

        if survey.proofs_enabled() && survey.query.ranges.iter().any(|r| !r.is_unchecked()) {
            self.spawn_range_proofs(survey, values.clone());
        }

        let joint = survey.joint_key;
        let k = survey.query.cutting_factor.max(1);
        let response = tokio::task::spawn_blocking(move || {
            let mut rng = OsRng;
            values
                .into_iter()
                .map(|(group, v)| (group, encrypt_int_vector(&joint, &v, &mut rng).replicate(k)))
                .collect::<GroupedResponse>()
        })
        .await?;
        tracing::debug!(node = %self.id, session = %survey.session_id, groups = response.len(), "response encrypted");
        Ok(response)
    }

    /// Per-group encoded values, or zeros when the rows cannot or may not be used.
    pub fn local_values(&self, survey: &SurveyQuery) -> Result<LocalValues, SurveyError> {
        let query = &survey.query;
        let op = operation_for(&query.operation)?;
        let groups = query.group_keys();
        let neutral = || -> LocalValues { groups.iter().map(|g| (g.clone(), vec![0; op.output_width()])).collect() };

        let mut loaded: Vec<(GroupKey, Columns)> = Vec::with_capacity(groups.len());
        for group in &groups {
            match self.loader.provide_group(query, group) {
                Ok(cols) => loaded.push((group.clone(), cols)),
                Err(e) => {
                    tracing::warn!(node = %self.id, session = %survey.session_id, error = %e, "loader failed; answering neutrally");
                    return Ok(neutral());
                }
            }
        }

        let mut union: Columns = vec![Vec::new(); query.selector.len()];
        for (_, cols) in &loaded {
            for (all, col) in union.iter_mut().zip(cols) {
                all.extend_from_slice(col);
            }
        }
        if !self.neutralizer.vet(query, &union) {
            tracing::warn!(node = %self.id, session = %survey.session_id, "result vetoed; answering neutrally");
            return Ok(neutral());
        }

        let mut out = LocalValues::new();
        for (group, cols) in loaded {
            match op.encode_local(&cols) {
                Ok(v) => {
                    out.insert(group, v);
                }
                Err(e) => {
                    tracing::warn!(node = %self.id, session = %survey.session_id, error = %e, "encoding failed; answering neutrally");
                    return Ok(neutral());
                }
            }
        }
        Ok(out)
    }

    fn spawn_range_proofs(&self, survey: &SurveyQuery, values: LocalValues) {
        let keys = self.proof_keys.clone();
        let bounds = survey.query.ranges.clone();
        let handle = spawn_proof(self.network.clone(), self.id.clone(), survey, ProofCategory::Range, async move {
            let keys = keys.ensure().await?;
            tokio::task::spawn_blocking(move || {
                let mut rng = OsRng;
                let mut sets = BTreeMap::new();
                for (group, v) in values {
                    sets.insert(group, RangeProofSet::prove(&mut rng, &keys.pk, &v, &bounds)?);
                }
                Ok::<_, SurveyError>(ProofPayload::Range(sets))
            })
            .await?
        });

        let mut tasks = self.proof_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, h| !h.is_finished());
        if let Some(old) = tasks.insert(survey.session_id, handle) {
            old.abort();
        }
    }
}

/// Zero ciphertexts for every group.
pub(crate) fn zero_response(groups: &[GroupKey], width: usize) -> GroupedResponse {
    groups
        .iter()
        .map(|g| (g.clone(), CipherVector(vec![Ciphertext::zero(); width])))
        .collect()
}

/// Slot-wise `acc += other`, group by group. Both sides must carry the same groups.
pub(crate) fn add_grouped(acc: &mut GroupedResponse, other: &GroupedResponse) -> Result<(), SurveyError> {
    if acc.len() != other.len() {
        return Err(SurveyError::ShapeMismatch(format!(
            "expected {} groups, got {}",
            acc.len(),
            other.len()
        )));
    }
    for (group, v) in acc.iter_mut() {
        let o = other
            .get(group)
            .ok_or_else(|| SurveyError::ShapeMismatch(format!("missing group {group}")))?;
        v.add_assign(o)
            .map_err(|e| SurveyError::ShapeMismatch(format!("group {group}: {e}")))?;
    }
    Ok(())
}

/// Undo the cutting-factor replication of one provider response.
pub(crate) fn truncate_response(
    response: GroupedResponse,
    groups: &[GroupKey],
    width: usize,
    k: usize,
) -> Result<GroupedResponse, SurveyError> {
    let k = k.max(1);
    let mut out = GroupedResponse::new();
    for group in groups {
        let v = response
            .get(group)
            .ok_or_else(|| SurveyError::ShapeMismatch(format!("response lacks group {group}")))?;
        if v.len() % k != 0 {
            return Err(SurveyError::ShapeMismatch(format!(
                "group {group}: length {} is not a multiple of the cutting factor {k}",
                v.len()
            )));
        }
        let logical = v.len() / k;
        if logical != width {
            return Err(SurveyError::ShapeMismatch(format!(
                "group {group}: {logical} slots, operator produces {width}"
            )));
        }
        out.insert(group.clone(), CipherVector(v.0[..logical].to_vec()));
    }
    Ok(out)
}

/// Announce to this node's providers and sum their responses.
pub async fn collect(ctx: &NodeContext, survey: &SurveyQuery) -> Result<Collected, SurveyError> {
    let session = survey.session_id;
    let providers = survey.providers_of(&ctx.id).to_vec();
    let op = operation_for(&survey.query.operation)?;
    let width = op.output_width();
    let groups = survey.query.group_keys();

    let collector = ctx.replies.expect(session, ProtocolKind::DataCollection, providers.len());
    for dp in &providers {
        ctx.network
            .send_detached(&ctx.id, dp, session, Message::Announce(survey.clone()));
    }
    let replies = collector.collect().await?;

    let mut sum = zero_response(&groups, width);
    let mut responses = Vec::with_capacity(replies.len());
    for Envelope { from, message, .. } in replies {
        let Message::DpResponse(raw) = message else {
            return Err(SurveyError::Internal(format!("unexpected reply from {from}")));
        };
        let response = truncate_response(raw, &groups, width, survey.query.cutting_factor)?;
        add_grouped(&mut sum, &response)?;
        responses.push(response);
    }

    tracing::info!(node = %ctx.id, %session, providers = providers.len(), "data collected");
    Ok(Collected { sum, responses })
}

/// Run collection and publish the outcome on the session.
pub async fn run_collection(ctx: Arc<NodeContext>, survey: SurveyQuery) {
    let outcome = collect(&ctx, &survey).await.map_err(|e| {
        tracing::warn!(node = %ctx.id, session = %survey.session_id, error = %e, "data collection failed");
        e.to_string()
    });
    if let Err(e) = ctx
        .sessions
        .mutate(&survey.session_id, |s| s.set_collected(outcome))
        .await
    {
        tracing::debug!(node = %ctx.id, session = %survey.session_id, error = %e, "collection outcome discarded");
    }
}
