//! Executions and their lifecycle state machine

use crate::application::ApplicationDescription;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "image download")]
    ImageDownload,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "cleaning up")]
    CleaningUp,
    #[serde(rename = "terminated")]
    Terminated,
    #[serde(rename = "error")]
    Error,
}

impl ExecutionStatus {
    /// An execution is active until it reaches a final status.
    pub fn is_active(&self) -> bool {
        !matches!(self, ExecutionStatus::Terminated | ExecutionStatus::Error)
    }

    /// Statuses counted against the guest execution quota.
    pub fn counts_toward_quota(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Submitted
                | ExecutionStatus::Scheduled
                | ExecutionStatus::Starting
                | ExecutionStatus::ImageDownload
                | ExecutionStatus::Running
        )
    }

    /// Validate a transition along the execution state diagram.
    ///
    /// Termination may begin from any active status; any non-final status
    /// may fall into error.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Submitted, Scheduled) => true,
            (Scheduled, Starting) => true,
            (Starting, ImageDownload) | (Starting, Running) => true,
            (ImageDownload, Running) => true,
            (Submitted | Scheduled | Starting | ImageDownload | Running, CleaningUp) => true,
            (CleaningUp, Terminated) => true,
            (s, Error) => s.is_active(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Submitted => "submitted",
            ExecutionStatus::Scheduled => "scheduled",
            ExecutionStatus::Starting => "starting",
            ExecutionStatus::ImageDownload => "image download",
            ExecutionStatus::Running => "running",
            ExecutionStatus::CleaningUp => "cleaning up",
            ExecutionStatus::Terminated => "terminated",
            ExecutionStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(ExecutionStatus::Submitted),
            "scheduled" => Ok(ExecutionStatus::Scheduled),
            "starting" => Ok(ExecutionStatus::Starting),
            "image download" => Ok(ExecutionStatus::ImageDownload),
            "running" => Ok(ExecutionStatus::Running),
            "cleaning up" => Ok(ExecutionStatus::CleaningUp),
            "terminated" => Ok(ExecutionStatus::Terminated),
            "error" => Ok(ExecutionStatus::Error),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// An instance of a submitted ZApp progressing through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub name: String,

    /// Username of the owner
    pub user_id: String,

    pub status: ExecutionStatus,

    /// The ZApp description as submitted
    pub description: ApplicationDescription,

    pub time_submit: DateTime<Utc>,
    pub time_start: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionStatus::*;

    #[test]
    fn happy_path_transitions() {
        assert!(Submitted.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(Starting));
        assert!(Starting.can_transition_to(ImageDownload));
        assert!(Starting.can_transition_to(Running));
        assert!(ImageDownload.can_transition_to(Running));
        assert!(Running.can_transition_to(CleaningUp));
        assert!(CleaningUp.can_transition_to(Terminated));
    }

    #[test]
    fn terminate_allowed_from_any_active_status() {
        for status in [Submitted, Scheduled, Starting, ImageDownload, Running] {
            assert!(status.can_transition_to(CleaningUp), "{status}");
        }
        assert!(!Terminated.can_transition_to(CleaningUp));
    }

    #[test]
    fn error_reachable_from_active_only() {
        assert!(Running.can_transition_to(Error));
        assert!(Submitted.can_transition_to(Error));
        assert!(!Terminated.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }

    #[test]
    fn no_backwards_transitions() {
        assert!(!Running.can_transition_to(Scheduled));
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Scheduled.can_transition_to(Submitted));
    }

    #[test]
    fn quota_statuses() {
        for status in [Submitted, Scheduled, Starting, ImageDownload, Running] {
            assert!(status.counts_toward_quota());
        }
        for status in [CleaningUp, Terminated, Error] {
            assert!(!status.counts_toward_quota());
        }
    }

    #[test]
    fn wire_strings_round_trip() {
        for status in [Submitted, ImageDownload, CleaningUp, Error] {
            let text = serde_json::to_string(&status).unwrap();
            let back: super::ExecutionStatus = serde_json::from_str(&text).unwrap();
            assert_eq!(status, back);
        }
        assert_eq!(
            serde_json::to_string(&ImageDownload).unwrap(),
            "\"image download\""
        );
    }
}
