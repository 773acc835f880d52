//! Zoe Backend - Container backend driver abstraction
//!
//! The scheduler talks to container runtimes exclusively through the
//! [`ContainerBackend`] trait: create/destroy containers, inspect node
//! image inventories, and observe the cluster as an immutable statistics
//! snapshot. Concrete production backings live outside the core; the
//! in-memory [`SimulatedBackend`] serves tests and development
//! deployments.

pub mod error;
pub mod simulated;
pub mod stats;

pub use error::{BackendError, Result};
pub use simulated::{SimulatedBackend, SimulatedNodeSpec};
pub use stats::{ClusterStats, ClusterStatsProvider, ImageInventory, NodeStats, NodeStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Materialized configuration for one container, built by the scheduler
/// from a service row and the deployment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOptions {
    /// Backend-visible container name
    pub name: String,

    /// Docker image reference
    pub image: String,

    pub environment: Vec<(String, String)>,
    pub volumes: Vec<VolumeBind>,
    pub command: Option<String>,

    /// Labels stamped on the container; Zoe uses them to recognize its
    /// own containers in backend events
    pub labels: HashMap<String, String>,

    /// Memory reservation in bytes
    pub memory_limit: i64,

    /// Core reservation, fractional cores allowed
    pub cores_limit: f64,

    /// Declared ports to expose
    pub ports: Vec<PortRequest>,
}

/// A host path bind-mounted into the container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeBind {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// One port the backend should expose on an external address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRequest {
    /// `<number>/<proto>` as declared by the service
    pub internal_name: String,
    pub number: u16,
}

/// Result of a successful container creation
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    /// Backend-assigned container id
    pub container_id: String,

    /// External addresses assigned to the requested ports
    pub ports: Vec<PortBinding>,
}

/// External address assigned to one requested port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    pub internal_name: String,
    pub external_ip: String,
    pub external_port: u16,
}

/// Abstract capability set the scheduler requires from a container
/// runtime.
///
/// `destroy_container` must be idempotent: destroying an unknown id is a
/// success. All calls may take network time; callers bound them with a
/// timeout.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create and start a container on the named node.
    async fn create_container(
        &self,
        options: &ContainerOptions,
        node: &str,
    ) -> Result<ContainerHandle>;

    /// Destroy a container. Unknown ids are not an error.
    async fn destroy_container(&self, container_id: &str) -> Result<()>;

    /// Image references available on the named node, grouped by image.
    async fn list_images(&self, node: &str) -> Result<Vec<ImageInventory>>;

    /// Poll the cluster and return a consistent statistics snapshot.
    async fn snapshot_cluster(&self) -> Result<ClusterStats>;
}
