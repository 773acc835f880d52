//! Scheduler statistics exposed through the API facade

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time view of the scheduler actor's state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Executions waiting for essential placement
    pub queue_length: usize,

    /// Executions with committed placements
    pub running_executions: usize,

    /// Scheduling passes run since startup
    pub pass_count: u64,

    /// Executions terminated since startup
    pub termination_count: u64,

    /// Per-node placement information
    pub node_stats: Vec<NodeSchedulerStats>,
}

/// Placements committed to one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSchedulerStats {
    pub name: String,

    /// Services currently committed to this node, keyed by integer
    /// service id
    pub service_stats: BTreeMap<i64, ServiceSlotStats>,
}

/// Reservation of one committed service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSlotStats {
    pub memory_min: i64,
    pub cores_min: f64,
}
