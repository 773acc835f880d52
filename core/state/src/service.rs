//! Services and their runtime placement attributes

use crate::application::{ResourceReservation, ServiceDescription};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Zoe-side status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Not placed anywhere
    Inactive,
    /// Placed by the scheduler, container not started yet
    Runnable,
    /// Container started on the assigned node
    Active,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Inactive => write!(f, "inactive"),
            ServiceStatus::Runnable => write!(f, "runnable"),
            ServiceStatus::Active => write!(f, "active"),
        }
    }
}

/// Last observed container state on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// No container has ever been created for this service
    Undefined,
    Created,
    Started,
    Die,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendStatus::Undefined => write!(f, "undefined"),
            BackendStatus::Created => write!(f, "created"),
            BackendStatus::Started => write!(f, "started"),
            BackendStatus::Die => write!(f, "die"),
        }
    }
}

/// One service of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub execution_id: i64,

    /// Username of the owning execution's owner, denormalized for
    /// ownership checks
    pub user_id: String,

    pub name: String,
    pub status: ServiceStatus,
    pub backend_status: BackendStatus,

    /// Node the service is assigned to, when placed
    pub backend_host: Option<String>,

    /// Container id on the backend, when a container exists
    pub container_id: Option<String>,

    /// The service part of the ZApp description
    pub description: ServiceDescription,
}

impl Service {
    pub fn essential(&self) -> bool {
        self.description.essential
    }

    pub fn monitor(&self) -> bool {
        self.description.monitor
    }

    pub fn image_name(&self) -> &str {
        &self.description.image
    }

    pub fn resource_reservation(&self) -> &ResourceReservation {
        &self.description.resources
    }

    pub fn labels(&self) -> &BTreeSet<String> {
        &self.description.labels
    }

    pub fn startup_order(&self) -> u32 {
        self.description.startup_order
    }
}
