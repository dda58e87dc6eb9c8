use thiserror::Error;

use crate::core::errors::ChatError;

/// Failures during process startup, mapped to the CLI exit codes.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("configuration error: {0}")]
    Config(ChatError),
    #[error("storage initialization failed: {0}")]
    Storage(ChatError),
    #[error("sidecar failed to start: {0}")]
    Sidecar(ChatError),
    #[error("model not found: {0}")]
    ModelNotFound(String),
    #[error("server error: {0}")]
    Server(String),
}

impl InitializationError {
    pub fn exit_code(&self) -> u8 {
        match self {
            InitializationError::Sidecar(_) => 2,
            InitializationError::ModelNotFound(_) => 3,
            InitializationError::Storage(_) => 4,
            InitializationError::Config(_) | InitializationError::Server(_) => 1,
        }
    }
}
