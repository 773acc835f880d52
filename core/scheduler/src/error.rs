//! Scheduler error types

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler-specific error types
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler is unreachable")]
    Unreachable,

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("event channel authentication failed")]
    EventAuth,

    #[error("state store error: {0}")]
    State(#[from] zoe_state::StateError),

    #[error("backend error: {0}")]
    Backend(#[from] zoe_backend::BackendError),
}

impl SchedulerError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        SchedulerError::InvalidState {
            message: message.into(),
        }
    }

    /// True when the scheduler actor cannot be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SchedulerError::Unreachable)
    }
}
