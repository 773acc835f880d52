//! Facade error kinds and their HTTP mapping
//!
//! The facade classifies every failure into one of these kinds; the REST
//! layer maps the kind to a status code and emits `{message: <string>}`.

use zoe_scheduler::SchedulerError;
use zoe_state::{StateError, ValidationError};

/// Result type alias for facade operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// Tagged error kinds surfaced to API clients
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("invalid application description: {message}")]
    InvalidDescription { message: String },

    #[error("{message}")]
    InvalidState { message: String },

    #[error("no such {what}")]
    NotFound { what: String },

    #[error("authentication failed")]
    Auth,

    #[error("access denied: {message}")]
    Forbidden { message: String },

    #[error("the Zoe master is unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ApiError::NotFound { what: what.into() }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        ApiError::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            message: message.into(),
        }
    }

    /// Stable kind name for logging and client-side handling.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidDescription { .. } => "invalid-description",
            ApiError::InvalidState { .. } => "invalid-state",
            ApiError::NotFound { .. } => "not-found",
            ApiError::Auth => "auth",
            ApiError::Forbidden { .. } => "forbidden",
            ApiError::BackendUnavailable { .. } => "backend-unavailable",
            ApiError::Internal { .. } => "internal",
        }
    }

    /// HTTP status code the REST layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::InvalidDescription { .. } => 400,
            ApiError::InvalidState { .. } => 400,
            ApiError::NotFound { .. } => 404,
            ApiError::Auth => 401,
            ApiError::Forbidden { .. } => 403,
            ApiError::BackendUnavailable { .. } => 503,
            ApiError::Internal { .. } => 500,
        }
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound { kind, .. } => ApiError::NotFound {
                what: kind.to_string(),
            },
            StateError::Forbidden { .. } => ApiError::Auth,
            StateError::InvalidTransition { from, to } => ApiError::InvalidState {
                message: format!("illegal status transition {} -> {}", from, to),
            },
            StateError::InvalidState { message } => ApiError::InvalidState { message },
            StateError::Storage(err) => ApiError::Internal {
                message: err.to_string(),
            },
            StateError::Serialization(err) => ApiError::Internal {
                message: err.to_string(),
            },
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Unreachable => ApiError::BackendUnavailable {
                message: "scheduler is not responding".to_string(),
            },
            SchedulerError::InvalidState { message } => ApiError::InvalidState { message },
            SchedulerError::EventAuth => ApiError::Auth,
            SchedulerError::State(err) => err.into(),
            SchedulerError::Backend(err) => ApiError::BackendUnavailable {
                message: err.to_string(),
            },
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::InvalidDescription { message: err.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping() {
        assert_eq!(
            ApiError::InvalidDescription {
                message: String::new()
            }
            .http_status(),
            400
        );
        assert_eq!(ApiError::not_found("execution").http_status(), 404);
        assert_eq!(ApiError::Auth.http_status(), 401);
        assert_eq!(ApiError::forbidden("admins only").http_status(), 403);
        assert_eq!(
            ApiError::BackendUnavailable {
                message: String::new()
            }
            .http_status(),
            503
        );
    }

    #[test]
    fn ownership_failures_map_to_auth() {
        let err: ApiError = StateError::Forbidden {
            uid: "bob".to_string(),
            kind: "execution",
            id: "1".to_string(),
        }
        .into();
        assert!(matches!(err, ApiError::Auth));
        assert_eq!(err.kind(), "auth");
    }
}
