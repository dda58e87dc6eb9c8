use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the chat core.
///
/// Validation / NotFound / Busy surface synchronously to the command caller;
/// streaming failures are reported on the event bus and additionally finalize
/// any placeholder message they belong to.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("prompt too long: {0}")]
    PromptTooLong(String),
    #[error("sidecar unavailable: {0}")]
    SidecarUnavailable(String),
    #[error("generation interrupted: {0}")]
    GenerationInterrupted(String),
    #[error("download error: {0}")]
    Download(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn validation<M: std::fmt::Display>(msg: M) -> Self {
        ChatError::Validation(msg.to_string())
    }

    pub fn not_found<M: std::fmt::Display>(msg: M) -> Self {
        ChatError::NotFound(msg.to_string())
    }

    pub fn busy<M: std::fmt::Display>(msg: M) -> Self {
        ChatError::Busy(msg.to_string())
    }

    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        ChatError::Storage(err.to_string())
    }

    pub fn download<E: std::fmt::Display>(err: E) -> Self {
        ChatError::Download(err.to_string())
    }

    pub fn sidecar<E: std::fmt::Display>(err: E) -> Self {
        ChatError::SidecarUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ChatError::NotFound("row not found".to_string()),
            other => ChatError::Storage(other.to_string()),
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind) = match &self {
            ChatError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            ChatError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ChatError::Busy(_) => (StatusCode::CONFLICT, "busy"),
            ChatError::PromptTooLong(_) => (StatusCode::BAD_REQUEST, "prompt_too_long"),
            ChatError::SidecarUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "sidecar_unavailable")
            }
            ChatError::GenerationInterrupted(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "generation_interrupted")
            }
            ChatError::Download(_) => (StatusCode::INTERNAL_SERVER_ERROR, "download"),
            ChatError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        };

        let body = Json(json!({ "error": self.to_string(), "kind": kind }));
        (status, body).into_response()
    }
}
