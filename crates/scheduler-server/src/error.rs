//! Control API error shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scheduler_core::engine::ControlError;
use scheduler_core::EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown job {0:?}")]
    UnknownJob(String),

    #[error("unknown run {0}")]
    UnknownRun(uuid::Uuid),

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("scheduler running blocks manual run: stop the scheduler or switch to single-task mode")]
    ManualRunBlocked,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::UnknownJob(id) => ApiError::UnknownJob(id),
            ControlError::UnknownRun(id) => ApiError::UnknownRun(id),
            ControlError::ManualRunBlockedByAuto => ApiError::ManualRunBlocked,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::InvalidSpec(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::UnknownJob(id) => (StatusCode::NOT_FOUND, "UNKNOWN_JOB", format!("unknown job {id:?}")),
            ApiError::UnknownRun(id) => (StatusCode::NOT_FOUND, "UNKNOWN_RUN", format!("unknown run {id}")),
            ApiError::InvalidSpec(msg) => (StatusCode::BAD_REQUEST, "INVALID_SPEC", msg.clone()),
            ApiError::ManualRunBlocked => (StatusCode::CONFLICT, "MANUAL_RUN_BLOCKED", self.to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone()),
        };

        let body = Json(json!({ "error": code, "message": message }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
