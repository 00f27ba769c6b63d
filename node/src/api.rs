use crate::db;
use crate::errors::ApiError;
use crate::models::*;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ListBlocksParams {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LedgerResponse {
    pub offset: u64,
    pub limit: u64,
    pub blocks: Vec<BlockRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RangeVkResponse {
    pub curve: String,
    pub proof_system: String,
    pub vk_b64: String,
}

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/v1/surveys", post(create_survey))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/surveys/:id/verification", get(get_verification))
        .route("/api/v1/topology", get(get_topology))
        .route("/api/v1/ledger", get(list_ledger))
        .route("/api/v1/zk/vk", get(get_vk))
        .merge(protected_routes)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(provided_key) = headers.get("X-API-KEY") {
        if provided_key == state.config.api_key.as_str() {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!("unauthorized access attempt");
    Err(StatusCode::UNAUTHORIZED)
}

async fn create_survey(
    State(state): State<AppState>,
    Json(req): Json<SurveyRequest>,
) -> Result<Json<SurveyResponse>, ApiError> {
    let root = state
        .cluster
        .root()
        .cloned()
        .ok_or_else(|| ApiError::Conflict("no computing nodes".to_string()))?;

    let survey = state
        .client
        .generate_survey_query(state.cluster.topology(), req.query, req.thresholds);
    let session_id = survey.session_id;
    let proofs_requested = survey.proofs_enabled();

    let results = state.client.send_survey_query(&root, survey).await?;

    Ok(Json(SurveyResponse {
        session_id,
        results,
        proofs_requested,
        verification_endpoint: format!("/api/v1/surveys/{session_id}/verification"),
    }))
}

async fn get_verification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VerificationResponse>, ApiError> {
    if let Some(block) = db::latest_block(&state.db, id).await? {
        return Ok(Json(VerificationResponse {
            session_id: id,
            disposition: block.disposition,
            bitmap: block.bitmap.clone(),
            block: Some(block),
        }));
    }

    // Undecided sessions have counts but no block yet.
    let Some(status) = state.cluster.verification_status(&id) else {
        return Err(ApiError::NotFound("session not found".to_string()));
    };
    Ok(Json(VerificationResponse {
        session_id: id,
        disposition: status.disposition,
        bitmap: status.bitmap,
        block: None,
    }))
}

async fn get_topology(State(state): State<AppState>) -> Json<Topology> {
    Json(state.cluster.topology().clone())
}

async fn list_ledger(
    State(state): State<AppState>,
    Query(params): Query<ListBlocksParams>,
) -> Result<Json<LedgerResponse>, ApiError> {
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(50).min(500);
    let blocks = db::list_blocks(&state.db, offset, limit).await?;
    Ok(Json(LedgerResponse { offset, limit, blocks }))
}

async fn get_vk(State(state): State<AppState>) -> Result<Json<RangeVkResponse>, ApiError> {
    let keys = state.cluster.proof_keys().ensure().await?;
    let vk_bytes = survey_zk::groth16::serialize_vk(&keys.vk).map_err(|_| ApiError::Internal)?;

    let b64 = base64::engine::general_purpose::STANDARD.encode(vk_bytes);

    Ok(Json(RangeVkResponse {
        curve: "bn254".to_string(),
        proof_system: "groth16".to_string(),
        vk_b64: b64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::cluster::LocalCluster;
    use crate::config::{ClusterConfig, Config};
    use crate::provider::{AcceptAll, DataLoader, Neutralizer, StaticLoader};
    use crate::state::ProofKeys;
    use crate::verification::Ledger;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, AppState) {
        let db = db::connect_in_memory().await.unwrap();
        let config = Config::from_lookup(|key| match key {
            "API_KEY" => Some("test-key".to_string()),
            "SURVEY_COMPUTING_NODES" => Some("2".to_string()),
            "SURVEY_PROVIDERS_PER_NODE" => Some("1".to_string()),
            "SURVEY_VERIFYING_NODES" => Some("1".to_string()),
            "SURVEY_DECRYPTION_LIMIT" => Some("100".to_string()),
            _ => None,
        })
        .unwrap();
        let cluster_config: ClusterConfig = config.cluster.clone();
        let cluster = LocalCluster::start(&cluster_config, Ledger::new(db.clone()), ProofKeys::default(), |_, _| {
            (
                Arc::new(StaticLoader::single(vec![3, 4])) as Arc<dyn DataLoader>,
                Arc::new(AcceptAll) as Arc<dyn Neutralizer>,
            )
        });
        let client: Client = cluster.client("api-client").await.unwrap();
        let state = AppState::new(db, config, cluster, client);
        (router(state.clone()), state)
    }

    fn survey_body() -> Body {
        let req = SurveyRequest {
            query: crate::models::Query::new(OperationSpec::named("sum"), vec!["0".into()]),
            thresholds: Thresholds::default(),
        };
        Body::from(serde_json::to_vec(&req).unwrap())
    }

    #[tokio::test]
    async fn surveys_require_the_api_key() {
        let (app, _) = app().await;
        let res = app
            .oneshot(
                HttpRequest::post("/api/v1/surveys")
                    .header("content-type", "application/json")
                    .body(survey_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn a_survey_runs_through_the_api() {
        let (app, _) = app().await;
        let res = app
            .oneshot(
                HttpRequest::post("/api/v1/surveys")
                    .header("content-type", "application/json")
                    .header("X-API-KEY", "test-key")
                    .body(survey_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let res: SurveyResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(res.results[DEFAULT_GROUP], vec![14.0]);
        assert!(!res.proofs_requested);
    }

    #[tokio::test]
    async fn invalid_surveys_are_bad_requests() {
        let (app, _) = app().await;
        // Thresholds without proofs.
        let query = crate::models::Query::new(OperationSpec::named("sum"), vec!["0".into()]);
        let body = serde_json::to_vec(&SurveyRequest {
            query,
            thresholds: Thresholds::uniform(1),
        })
        .unwrap();
        let res = app
            .oneshot(
                HttpRequest::post("/api/v1/surveys")
                    .header("content-type", "application/json")
                    .header("X-API-KEY", "test-key")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn topology_and_unknown_sessions() {
        let (app, state) = app().await;
        let res = app
            .clone()
            .oneshot(HttpRequest::get("/api/v1/topology").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let topology: Topology = serde_json::from_slice(&body).unwrap();
        assert_eq!(&topology, state.cluster.topology());
        assert_eq!(topology.computing_nodes.len(), 2);

        let uri = format!("/api/v1/surveys/{}/verification", Uuid::new_v4());
        let res = app
            .clone()
            .oneshot(HttpRequest::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = app
            .oneshot(HttpRequest::get("/api/v1/ledger").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn decided_sessions_are_served_from_the_ledger() {
        let (app, state) = app().await;
        let session = Uuid::new_v4();
        let bitmap = VerificationBitmap::new();
        db::append_block(&state.db, session, &bitmap, Disposition::Verified)
            .await
            .unwrap();

        let uri = format!("/api/v1/surveys/{session}/verification");
        let res = app
            .oneshot(HttpRequest::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let res: VerificationResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(res.disposition, Disposition::Verified);
        assert!(res.block.is_some());
    }
}
