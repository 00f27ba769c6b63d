//! Computing node: message dispatch and, on the root, the per-session orchestrator.

use crate::errors::SurveyError;
use crate::models::{GroupedResponse, NodeId, SurveyQuery};
use crate::network::{Envelope, Mailbox, Message};
use crate::protocols::{close_session, data_collection, finish_session, tree, NodeContext};
use crate::validation::validate;
use rand::rngs::OsRng;
use std::sync::Arc;
use survey_zk::proofs::ShuffleRandomness;
use tokio::task::JoinHandle;

pub struct ComputingNode {
    ctx: Arc<NodeContext>,
}

impl ComputingNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn spawn(&self, mut mailbox: Mailbox) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            while let Some(env) = mailbox.recv().await {
                dispatch(&ctx, env).await;
            }
            tracing::debug!(node = %ctx.id, "mailbox closed");
        })
    }
}

/// One handler per message variant; replies go to whoever is collecting them.
async fn dispatch(ctx: &Arc<NodeContext>, env: Envelope) {
    let env = match ctx.replies.route(env) {
        Ok(()) => return,
        Err(env) => env,
    };
    let Envelope { from, session, message } = env;
    let ctx = ctx.clone();

    match message {
        Message::SurveyQuery(survey) if !survey.intra_message => {
            tokio::spawn(async move { Orchestrator::serve(ctx, from, survey).await });
        }
        Message::SurveyQuery(survey) => join_survey(&ctx, survey).await,
        Message::DroRequest(list) => {
            tokio::spawn(async move { tree::handle_dro(&ctx, session, list).await });
        }
        Message::AggregationRequest => {
            tokio::spawn(async move { tree::handle_aggregation(&ctx, from, session).await });
        }
        Message::ObfuscationRequest(data) => {
            tokio::spawn(async move { tree::handle_obfuscation(&ctx, session, data).await });
        }
        Message::KeySwitchRequest(data) => {
            tokio::spawn(async move { tree::handle_key_switch(&ctx, from, session, data).await });
        }
        Message::SessionClosed => {
            tokio::spawn(async move { close_session(&ctx, session).await });
        }
        other if other.reply_kind().is_some() => {
            tracing::debug!(node = %ctx.id, %session, %from, message = other.name(), "late reply dropped");
        }
        other => {
            tracing::warn!(node = %ctx.id, %session, %from, message = other.name(), "unexpected message for a computing node");
        }
    }
}

/// Create the session and draw the shuffle randomness.
///
/// Returns `false` when the session already existed.
async fn open_session(ctx: &Arc<NodeContext>, survey: &SurveyQuery) -> Result<bool, SurveyError> {
    let id = survey.session_id;
    if let Some(existing) = ctx.sessions.try_get(&id) {
        if existing.lock().await.survey.same_survey(survey) {
            return Ok(false);
        }
        return Err(SurveyError::DuplicateSession(id.to_string()));
    }
    let handle = ctx.sessions.create(survey.clone())?;

    if survey.query.diffp.enabled() {
        let n = survey.query.diffp.noise_list_size;
        handle.lock().await.shuffle_randomness = Some(ShuffleRandomness::precompute(&mut OsRng, n));
    }
    Ok(true)
}

/// Non-root: join and collect from local providers in the background.
async fn join_survey(ctx: &Arc<NodeContext>, survey: SurveyQuery) {
    let session = survey.session_id;
    match open_session(ctx, &survey).await {
        Ok(true) => {
            tracing::info!(node = %ctx.id, %session, "joined survey");
            tokio::spawn(data_collection::run_collection(ctx.clone(), survey));
        }
        Ok(false) => tracing::debug!(node = %ctx.id, %session, "survey already known"),
        Err(e) => tracing::warn!(node = %ctx.id, %session, error = %e, "survey rejected"),
    }
}

pub struct Orchestrator;

impl Orchestrator {
    /// Run a client's survey and send the result back to it.
    pub async fn serve(ctx: Arc<NodeContext>, client: NodeId, survey: SurveyQuery) {
        let session = survey.session_id;
        let result = Self::execute(&ctx, survey).await;
        let reply = match result {
            Ok(Some(result)) => Ok(result),
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(node = %ctx.id, %session, error = %e, "survey failed");
                Err(e.to_string())
            }
        };
        if let Err(e) = ctx
            .network
            .send(&ctx.id, &client, session, Message::SurveyResult(reply))
            .await
        {
            tracing::warn!(node = %ctx.id, %session, error = %e, "result not delivered");
        }
    }

    /// Drive the phases in order. `None` means the survey was already running.
    pub async fn execute(ctx: &Arc<NodeContext>, mut survey: SurveyQuery) -> Result<Option<GroupedResponse>, SurveyError> {
        let session = survey.session_id;
        if survey.root() != Some(&ctx.id) {
            return Err(SurveyError::Validation(vec![format!(
                "survey must enter at the root computing node, not {}",
                ctx.id
            )]));
        }
        validate(&survey, survey.query.diffp.enabled()).into_result()?;

        survey.intra_message = true;
        if !open_session(ctx, &survey).await? {
            tracing::info!(node = %ctx.id, %session, "identical survey already running");
            return Ok(None);
        }
        tracing::info!(
            node = %ctx.id,
            %session,
            operation = %survey.query.operation.name,
            computing_nodes = survey.computing_nodes.len(),
            data_providers = survey.data_provider_count(),
            "survey started"
        );

        let result = Self::run_phases(ctx, &survey).await;
        if result.is_err() {
            Self::close_everywhere(ctx, &survey);
        }

        let (ctx2, survey2) = (ctx.clone(), survey.clone());
        tokio::spawn(async move { finish_session(&ctx2, &survey2).await });

        result.map(Some)
    }

    /// Tell every other participant to drop a failed session.
    fn close_everywhere(ctx: &NodeContext, survey: &SurveyQuery) {
        let peers = survey.computing_nodes.iter().filter(|n| **n != ctx.id);
        let verifiers = survey.query.verifiers.iter().filter(|_| survey.proofs_enabled());
        for peer in peers.chain(verifiers) {
            ctx.network
                .send_detached(&ctx.id, peer, survey.session_id, Message::SessionClosed);
        }
    }

    async fn run_phases(ctx: &Arc<NodeContext>, survey: &SurveyQuery) -> Result<GroupedResponse, SurveyError> {
        let session = survey.session_id;
        let peers = survey.computing_nodes.iter().filter(|n| **n != ctx.id);
        let verifiers = survey.query.verifiers.iter().filter(|_| survey.proofs_enabled());
        // Verifying nodes first, so they know the survey before any proof can reach them.
        for peer in verifiers.chain(peers) {
            ctx.network
                .send(&ctx.id, peer, session, Message::SurveyQuery(survey.clone()))
                .await?;
        }

        // Local collection completes before the cross-node phases start.
        data_collection::run_collection(ctx.clone(), survey.clone()).await;
        tree::wait_collected(ctx, survey).await?;

        let noise = if survey.query.diffp.enabled() {
            let noise = tree::run_dro(ctx, survey).await?;
            tracing::info!(node = %ctx.id, %session, size = noise.len(), "noise list shuffled");
            ctx.sessions.mutate(&session, |s| s.noise = Some(noise.clone())).await?;
            Some(noise)
        } else {
            None
        };

        let mut aggregate = tree::aggregate_subtree(ctx, survey).await?;
        if let Some(noise) = &noise {
            for (group, v) in aggregate.iter_mut() {
                v.add_prefix(noise)
                    .map_err(|e| SurveyError::ShapeMismatch(format!("noise for group {group}: {e}")))?;
            }
        }
        ctx.sessions
            .mutate(&session, |s| s.aggregate = Some(aggregate.clone()))
            .await?;
        tracing::info!(node = %ctx.id, %session, groups = aggregate.len(), "aggregation done");

        if survey.query.obfuscation {
            aggregate = tree::run_obfuscation(ctx, survey, aggregate).await?;
            tracing::info!(node = %ctx.id, %session, "obfuscation done");
        }

        let result = tree::run_key_switch(ctx, survey, &aggregate).await?;
        tracing::info!(node = %ctx.id, %session, "key switch done");
        Ok(result)
    }
}
