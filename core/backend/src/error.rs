//! Backend driver error types

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Backend driver error types
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("no such node: {node}")]
    NodeNotFound { node: String },

    #[error("container creation failed on {node}: {message}")]
    CreateFailed { node: String, message: String },

    #[error("backend call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("backend error: {message}")]
    Other { message: String },
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        BackendError::Unavailable {
            message: message.into(),
        }
    }

    /// Transient failures worth retrying on a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable { .. }
                | BackendError::Timeout { .. }
                | BackendError::CreateFailed { .. }
        )
    }
}
