//! Error types for the webhook pipeline.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use uuid::Uuid;

use crate::types::{WebhookSource, WebhookStatus};

/// Failures of the durable event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("webhook event not found: {0}")]
    NotFound(Uuid),

    #[error("webhook event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: WebhookStatus,
        to: WebhookStatus,
    },

    #[error("dead-letter entry not found for event {0}")]
    DeadLetterNotFound(Uuid),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A provider payload that is not valid JSON or lacks required fields.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required field `{field}` in {provider} payload")]
    MissingField {
        provider: WebhookSource,
        field: &'static str,
    },
}

/// Result of one pass through the processing wrapper.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("webhook store error: {0}")]
    Store(#[from] StoreError),

    /// The business handler's own error, returned unchanged.
    #[error(transparent)]
    Handler(anyhow::Error),
}

/// Errors surfaced by the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing signature header `{0}`")]
    MissingSignature(&'static str),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("webhook source {0} is not configured")]
    SourceNotConfigured(WebhookSource),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ProcessError> for ApiError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Store(e) => ApiError::Store(e),
            ProcessError::Handler(e) => ApiError::Handler(format!("{e:#}")),
        }
    }
}

/// JSON error body returned by every route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::MissingSignature(_) => (StatusCode::BAD_REQUEST, "missing_signature"),
            ApiError::InvalidSignature(_) => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            ApiError::InvalidPayload(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
            ApiError::SourceNotConfigured(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "source_not_configured")
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Handler(_) => (StatusCode::INTERNAL_SERVER_ERROR, "handler_error"),
            ApiError::Store(StoreError::NotFound(_) | StoreError::DeadLetterNotFound(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Store(StoreError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "invalid_transition")
            }
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
