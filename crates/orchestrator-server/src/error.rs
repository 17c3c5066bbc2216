use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use state_store::StoreError;
use thiserror::Error;
use workflow_engine::EngineError;

/// API error mapped to the JSON envelope
/// `{error, message, code?, details?, timestamp}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Unavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.label(),
            "message": self.to_string(),
            "code": status.as_u16(),
            "timestamp": Utc::now(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::VersionConflict { expected, actual } => ApiError::Conflict(format!(
                "version conflict: expected {}, found {}",
                expected, actual
            )),
            StoreError::Transient(message) => ApiError::Unavailable(message),
            StoreError::Fatal(message) => ApiError::Internal(message),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Validation(message) => ApiError::Validation(message),
            EngineError::NotFound(what) => ApiError::NotFound(what),
            EngineError::Store(store) => store.into(),
            EngineError::Lock(key) => {
                ApiError::Unavailable(format!("execution is busy: {}", key))
            }
            EngineError::InvalidState(message) => ApiError::Conflict(message),
            EngineError::InvalidToken => {
                ApiError::Unauthorized("approval token is invalid".to_string())
            }
            EngineError::TokenExpired => {
                ApiError::Unauthorized("approval token has expired".to_string())
            }
            EngineError::TicketConsumed => {
                ApiError::Conflict("approval was already answered".to_string())
            }
        }
    }
}
