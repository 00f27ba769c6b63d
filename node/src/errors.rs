use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use survey_zk::ZkError;
use thiserror::Error;

/// Protocol-level failures.
#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("invalid query: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("session {0} already exists with a different query")]
    DuplicateSession(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("threshold unreachable for category {0}")]
    ThresholdUnreachable(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("crypto: {0}")]
    Crypto(#[from] ZkError),

    #[error("ledger: {0}")]
    Ledger(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for SurveyError {
    fn from(e: sqlx::Error) -> Self {
        SurveyError::Ledger(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SurveyError {
    fn from(e: tokio::task::JoinError) -> Self {
        SurveyError::Internal(format!("task failed: {e}"))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error")]
    Internal,
}

impl From<SurveyError> for ApiError {
    fn from(e: SurveyError) -> Self {
        match e {
            SurveyError::Validation(_) | SurveyError::UnknownOperation(_) | SurveyError::ShapeMismatch(_) => {
                ApiError::BadRequest(e.to_string())
            }
            SurveyError::DuplicateSession(_) => ApiError::Conflict(e.to_string()),
            SurveyError::UnknownSession(_) => ApiError::NotFound(e.to_string()),
            other => {
                tracing::error!(error = %other, "survey failed");
                ApiError::Internal
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };

        (status, Json(ErrorBody { error: msg })).into_response()
    }
}
