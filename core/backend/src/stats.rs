//! Cluster statistics snapshots and the snapshot provider

use crate::error::{BackendError, Result};
use crate::ContainerBackend;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Availability of an execution host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

/// One image present on a node; a single image may be known under
/// several references (tags)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInventory {
    pub names: Vec<String>,
}

impl ImageInventory {
    /// Exact-string membership test against every known reference.
    pub fn contains(&self, image: &str) -> bool {
        self.names.iter().any(|n| n == image)
    }
}

/// Point-in-time statistics of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    pub name: String,
    pub status: NodeStatus,

    /// Memory in bytes
    pub memory_total: i64,
    pub memory_reserved: i64,

    /// Cores, fractional values allowed
    pub cores_total: f64,
    pub cores_reserved: f64,

    /// Containers currently running on the node
    pub container_count: usize,

    pub labels: BTreeSet<String>,
    pub images: Vec<ImageInventory>,
}

impl NodeStats {
    pub fn memory_free(&self) -> i64 {
        self.memory_total - self.memory_reserved
    }

    pub fn cores_free(&self) -> f64 {
        self.cores_total - self.cores_reserved
    }
}

/// Immutable point-in-time view of the whole cluster, produced by one
/// backend poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub taken_at: DateTime<Utc>,
    pub nodes: Vec<NodeStats>,
}

impl ClusterStats {
    pub fn new(nodes: Vec<NodeStats>) -> Self {
        Self {
            taken_at: Utc::now(),
            nodes,
        }
    }

    /// Age of the snapshot; grows when the provider serves a stale copy.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.taken_at
    }
}

/// Polls the backend for cluster statistics, keeping the last good
/// snapshot around to bridge transient backend failures.
pub struct ClusterStatsProvider {
    backend: Arc<dyn ContainerBackend>,
    last_good: Mutex<Option<ClusterStats>>,
}

impl ClusterStatsProvider {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            backend,
            last_good: Mutex::new(None),
        }
    }

    /// Return a consistent snapshot.
    ///
    /// On backend failure the last good snapshot is returned with its
    /// original timestamp, so callers can see its age; if the backend has
    /// never been polled successfully the provider reports unavailable.
    pub async fn snapshot(&self) -> Result<ClusterStats> {
        match self.backend.snapshot_cluster().await {
            Ok(stats) => {
                *self.last_good.lock() = Some(stats.clone());
                Ok(stats)
            }
            Err(err) => {
                let last_good = self.last_good.lock().clone();
                match last_good {
                    Some(stale) => {
                        warn!(
                            error = %err,
                            age_seconds = stale.age().num_seconds(),
                            "cluster poll failed, serving last good snapshot"
                        );
                        Ok(stale)
                    }
                    None => Err(BackendError::unavailable(format!(
                        "no cluster snapshot available: {}",
                        err
                    ))),
                }
            }
        }
    }
}
