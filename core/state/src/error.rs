//! State store error types

use crate::execution::ExecutionStatus;

/// Result type alias for state store operations
pub type Result<T> = std::result::Result<T, StateError>;

/// State store error types
#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("no such {kind}: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("caller {uid} may not access {kind} {id}")]
    Forbidden {
        uid: String,
        kind: &'static str,
        id: String,
    },

    #[error("illegal execution status transition {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StateError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn no_execution(id: i64) -> Self {
        Self::not_found("execution", id)
    }

    pub(crate) fn no_service(id: i64) -> Self {
        Self::not_found("service", id)
    }

    pub(crate) fn no_user(name: &str) -> Self {
        Self::not_found("user", name)
    }

    /// True when the record exists but is hidden from the caller.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, StateError::Forbidden { .. })
    }

    /// True when the referenced record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }
}
