//! Phases that run across the computing nodes.
//!
//! Aggregation and key switching fold up the binary tree; DRO and obfuscation are sequential
//! chains along its pre-order traversal, ending back at the root.

use super::data_collection::add_grouped;
use super::{children, next_in_traversal, submit_proof, NodeContext};
use crate::errors::SurveyError;
use crate::models::{GroupKey, GroupedResponse, NodeId, SessionId, SurveyQuery};
use crate::network::{Envelope, Message, ProtocolKind};
use crate::noise::encrypted_noise_list;
use crate::session::Collected;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use survey_zk::dleq::KeySwitchProof;
use survey_zk::elgamal::{apply_key_switch, key_switch_share, CipherVector, KeySwitchShare};
use survey_zk::proofs::{
    AggregationClaim, KeySwitchClaim, ObfuscationProof, ProofCategory, ProofPayload, ShuffleProof, ShuffleRandomness,
};

pub type GroupedShares = BTreeMap<GroupKey, Vec<KeySwitchShare>>;

fn root_of(survey: &SurveyQuery) -> Result<NodeId, SurveyError> {
    survey
        .root()
        .cloned()
        .ok_or_else(|| SurveyError::Internal("survey has no computing nodes".into()))
}

/// The survey behind `session`, once this node has joined it.
async fn joined_survey(ctx: &NodeContext, session: SessionId) -> Result<SurveyQuery, SurveyError> {
    let handle = ctx.sessions.get_within(&session).await?;
    let survey = handle.lock().await.survey.clone();
    Ok(survey)
}

fn unexpected(env: &Envelope) -> SurveyError {
    SurveyError::Internal(format!("unexpected {} from {}", env.message.name(), env.from))
}

// ---------------------------------------------------------------------------------------------
// DRO
// ---------------------------------------------------------------------------------------------

/// Shuffle and re-randomise the noise list with this node's precomputed randomness.
async fn shuffle_step(ctx: &NodeContext, survey: &SurveyQuery, list: CipherVector) -> Result<CipherVector, SurveyError> {
    let randomness = ctx
        .sessions
        .mutate(&survey.session_id, |s| s.shuffle_randomness.take())
        .await?;
    let joint = survey.joint_key;
    let (shuffled, proof) = tokio::task::spawn_blocking(move || {
        let mut rng = OsRng;
        let randomness = match randomness {
            Some(r) if r.len() == list.len() => r,
            _ => ShuffleRandomness::precompute(&mut rng, list.len()),
        };
        ShuffleProof::shuffle(&mut rng, &joint, &list, &randomness)
    })
    .await??;

    submit_proof(ctx, survey, ProofCategory::Shuffle, move || Ok(ProofPayload::Shuffle(proof))).await;
    Ok(shuffled)
}

/// Root: generate the encrypted noise list and run it through every computing node.
pub async fn run_dro(ctx: &NodeContext, survey: &SurveyQuery) -> Result<CipherVector, SurveyError> {
    let params = survey.query.diffp.clone();
    let joint = survey.joint_key;
    let list = tokio::task::spawn_blocking(move || encrypted_noise_list(&params, &joint, &mut OsRng)).await?;

    let shuffled = shuffle_step(ctx, survey, list).await?;
    let Some(next) = next_in_traversal(&survey.computing_nodes, &ctx.id) else {
        return Ok(shuffled);
    };

    let collector = ctx.replies.expect(survey.session_id, ProtocolKind::Dro, 1);
    ctx.network
        .send(&ctx.id, &next, survey.session_id, Message::DroRequest(shuffled))
        .await?;
    let mut replies = collector.collect().await?;
    match replies.pop() {
        Some(Envelope {
            message: Message::DroReply(list),
            ..
        }) => Ok(list),
        Some(env) => Err(unexpected(&env)),
        None => Err(SurveyError::Internal("no noise list returned".into())),
    }
}

/// Non-root: shuffle, then pass the list on (or back to the root at the end of the chain).
pub async fn handle_dro(ctx: &NodeContext, session: SessionId, list: CipherVector) {
    let survey = match joined_survey(ctx, session).await {
        Ok(survey) => survey,
        Err(e) => {
            tracing::warn!(node = %ctx.id, %session, error = %e, "noise list dropped");
            return;
        }
    };
    let result = async {
        let root = root_of(&survey)?;
        let shuffled = shuffle_step(ctx, &survey, list).await?;
        match next_in_traversal(&survey.computing_nodes, &ctx.id) {
            Some(next) => ctx.network.send(&ctx.id, &next, session, Message::DroRequest(shuffled)).await,
            None => ctx.network.send(&ctx.id, &root, session, Message::DroReply(shuffled)).await,
        }
    }
    .await;

    if let Err(e) = result {
        if let Some(root) = survey.root() {
            ctx.report_failure(root, session, ProtocolKind::Dro, &e);
        }
    }
}

// ---------------------------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------------------------

pub(crate) async fn wait_collected(ctx: &NodeContext, survey: &SurveyQuery) -> Result<Collected, SurveyError> {
    let mut rx = ctx
        .sessions
        .mutate(&survey.session_id, |s| s.subscribe_collected())
        .await?;
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| SurveyError::Internal("session dropped during collection".into()))?
        .clone();
    match outcome {
        Some(Ok(collected)) => Ok(collected),
        Some(Err(reason)) => Err(SurveyError::Internal(format!("data collection failed: {reason}"))),
        None => Err(SurveyError::Internal("data collection produced nothing".into())),
    }
}

/// This node's collected sum plus its children's subtree sums.
pub async fn aggregate_subtree(ctx: &NodeContext, survey: &SurveyQuery) -> Result<GroupedResponse, SurveyError> {
    let session = survey.session_id;
    let kids = children(&survey.computing_nodes, &ctx.id);

    let collector = ctx.replies.expect(session, ProtocolKind::Aggregation, kids.len());
    for kid in &kids {
        ctx.network
            .send(&ctx.id, kid, session, Message::AggregationRequest)
            .await?;
    }

    let local = wait_collected(ctx, survey).await?;
    let mut child_sums = Vec::with_capacity(kids.len());
    for env in collector.collect().await? {
        match env.message {
            Message::AggregationReply(sum) => child_sums.push(sum),
            _ => return Err(unexpected(&env)),
        }
    }

    let mut total = local.sum.clone();
    for sum in &child_sums {
        add_grouped(&mut total, sum)?;
    }

    let claims: BTreeMap<GroupKey, AggregationClaim> = total
        .iter()
        .map(|(group, output)| {
            let inputs = local
                .responses
                .iter()
                .chain(child_sums.iter())
                .filter_map(|r| r.get(group).cloned())
                .collect();
            (
                group.clone(),
                AggregationClaim {
                    inputs,
                    output: output.clone(),
                },
            )
        })
        .collect();
    submit_proof(ctx, survey, ProofCategory::Aggregation, move || Ok(ProofPayload::Aggregation(claims))).await;

    tracing::debug!(node = %ctx.id, %session, children = kids.len(), "subtree aggregated");
    Ok(total)
}

pub async fn handle_aggregation(ctx: &NodeContext, parent: NodeId, session: SessionId) {
    let survey = match joined_survey(ctx, session).await {
        Ok(survey) => survey,
        Err(e) => return ctx.report_failure(&parent, session, ProtocolKind::Aggregation, &e),
    };
    let result = match aggregate_subtree(ctx, &survey).await {
        Ok(sum) => ctx
            .network
            .send(&ctx.id, &parent, session, Message::AggregationReply(sum))
            .await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        ctx.report_failure(&parent, session, ProtocolKind::Aggregation, &e);
    }
}

// ---------------------------------------------------------------------------------------------
// Obfuscation
// ---------------------------------------------------------------------------------------------

async fn obfuscate_step(ctx: &NodeContext, survey: &SurveyQuery, data: GroupedResponse) -> Result<GroupedResponse, SurveyError> {
    let (out, proofs) = tokio::task::spawn_blocking(move || {
        let mut rng = OsRng;
        let mut out = GroupedResponse::new();
        let mut proofs = BTreeMap::new();
        for (group, v) in data {
            let (obfuscated, proof) = ObfuscationProof::obfuscate(&mut rng, &v);
            out.insert(group.clone(), obfuscated);
            proofs.insert(group, proof);
        }
        (out, proofs)
    })
    .await?;

    submit_proof(ctx, survey, ProofCategory::Obfuscation, move || Ok(ProofPayload::Obfuscation(proofs))).await;
    Ok(out)
}

/// Root: obfuscate, then pass the data along the chain until it comes back.
pub async fn run_obfuscation(ctx: &NodeContext, survey: &SurveyQuery, data: GroupedResponse) -> Result<GroupedResponse, SurveyError> {
    let out = obfuscate_step(ctx, survey, data).await?;
    let Some(next) = next_in_traversal(&survey.computing_nodes, &ctx.id) else {
        return Ok(out);
    };

    let collector = ctx.replies.expect(survey.session_id, ProtocolKind::Obfuscation, 1);
    ctx.network
        .send(&ctx.id, &next, survey.session_id, Message::ObfuscationRequest(out))
        .await?;
    let mut replies = collector.collect().await?;
    match replies.pop() {
        Some(Envelope {
            message: Message::ObfuscationReply(data),
            ..
        }) => Ok(data),
        Some(env) => Err(unexpected(&env)),
        None => Err(SurveyError::Internal("no obfuscated data returned".into())),
    }
}

pub async fn handle_obfuscation(ctx: &NodeContext, session: SessionId, data: GroupedResponse) {
    let survey = match joined_survey(ctx, session).await {
        Ok(survey) => survey,
        Err(e) => {
            tracing::warn!(node = %ctx.id, %session, error = %e, "obfuscation request dropped");
            return;
        }
    };
    let result = async {
        let root = root_of(&survey)?;
        let out = obfuscate_step(ctx, &survey, data).await?;
        match next_in_traversal(&survey.computing_nodes, &ctx.id) {
            Some(next) => ctx.network.send(&ctx.id, &next, session, Message::ObfuscationRequest(out)).await,
            None => ctx.network.send(&ctx.id, &root, session, Message::ObfuscationReply(out)).await,
        }
    }
    .await;

    if let Err(e) = result {
        if let Some(root) = survey.root() {
            ctx.report_failure(root, session, ProtocolKind::Obfuscation, &e);
        }
    }
}

// ---------------------------------------------------------------------------------------------
// Key switching
// ---------------------------------------------------------------------------------------------

fn add_shares(acc: &mut GroupedShares, other: &GroupedShares) -> Result<(), SurveyError> {
    for (group, shares) in acc.iter_mut() {
        let o = other
            .get(group)
            .ok_or_else(|| SurveyError::ShapeMismatch(format!("key switch reply lacks group {group}")))?;
        if o.len() != shares.len() {
            return Err(SurveyError::ShapeMismatch(format!(
                "group {group}: {} shares, expected {}",
                o.len(),
                shares.len()
            )));
        }
        for (a, b) in shares.iter_mut().zip(o) {
            *a += b;
        }
    }
    Ok(())
}

/// This node's shares towards the querier key, summed with its children's.
pub async fn key_switch_subtree(ctx: &NodeContext, survey: &SurveyQuery, data: &GroupedResponse) -> Result<GroupedShares, SurveyError> {
    let session = survey.session_id;
    let kids = children(&survey.computing_nodes, &ctx.id);

    let collector = ctx.replies.expect(session, ProtocolKind::KeySwitch, kids.len());
    for kid in &kids {
        ctx.network
            .send(&ctx.id, kid, session, Message::KeySwitchRequest(data.clone()))
            .await?;
    }

    let secret = ctx.keys.secret;
    let node_key = ctx.keys.public;
    let target = survey.querier_key;
    let input = data.clone();
    let (mut shares, claims) = tokio::task::spawn_blocking(move || {
        let mut rng = OsRng;
        let mut shares = GroupedShares::new();
        let mut claims = BTreeMap::new();
        for (group, v) in input {
            let mut own = Vec::with_capacity(v.len());
            let mut proofs = Vec::with_capacity(v.len());
            for ct in v.iter() {
                let (share, blind) = key_switch_share(&secret, &target, &ct.k, &mut rng);
                proofs.push(KeySwitchProof::prove(secret.0, blind, &node_key.0, &target.0, &ct.k, &share, &mut rng));
                own.push(share);
            }
            claims.insert(
                group.clone(),
                KeySwitchClaim {
                    node_key,
                    target,
                    ks: v.iter().map(|ct| ct.k).collect(),
                    shares: own.clone(),
                    proofs,
                },
            );
            shares.insert(group, own);
        }
        (shares, claims)
    })
    .await?;
    submit_proof(ctx, survey, ProofCategory::KeySwitch, move || Ok(ProofPayload::KeySwitch(claims))).await;

    for env in collector.collect().await? {
        match &env.message {
            Message::KeySwitchReply(other) => add_shares(&mut shares, other)?,
            _ => return Err(unexpected(&env)),
        }
    }
    Ok(shares)
}

/// Root: switch `data` from the joint key to the querier key.
pub async fn run_key_switch(ctx: &NodeContext, survey: &SurveyQuery, data: &GroupedResponse) -> Result<GroupedResponse, SurveyError> {
    let shares = key_switch_subtree(ctx, survey, data).await?;
    data.iter()
        .map(|(group, v)| -> Result<(GroupKey, CipherVector), SurveyError> {
            let summed = shares
                .get(group)
                .ok_or_else(|| SurveyError::ShapeMismatch(format!("no shares for group {group}")))?;
            let switched: CipherVector = v.iter().zip(summed).map(|(ct, s)| apply_key_switch(ct, s)).collect();
            Ok((group.clone(), switched))
        })
        .collect()
}

pub async fn handle_key_switch(ctx: &NodeContext, parent: NodeId, session: SessionId, data: GroupedResponse) {
    let survey = match joined_survey(ctx, session).await {
        Ok(survey) => survey,
        Err(e) => return ctx.report_failure(&parent, session, ProtocolKind::KeySwitch, &e),
    };
    let result = match key_switch_subtree(ctx, &survey, &data).await {
        Ok(shares) => ctx
            .network
            .send(&ctx.id, &parent, session, Message::KeySwitchReply(shares))
            .await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => super::finish_session(ctx, &survey).await,
        Err(e) => ctx.report_failure(&parent, session, ProtocolKind::KeySwitch, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_add_slot_wise_and_check_shape() {
        let zero = KeySwitchShare::zero();
        let mut acc = GroupedShares::from([("[0]".to_string(), vec![zero; 2])]);
        let other = GroupedShares::from([("[0]".to_string(), vec![zero; 2])]);
        add_shares(&mut acc, &other).unwrap();

        let short = GroupedShares::from([("[0]".to_string(), vec![zero])]);
        assert!(add_shares(&mut acc, &short).is_err());
        assert!(add_shares(&mut acc, &GroupedShares::new()).is_err());
    }
}
