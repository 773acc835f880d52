//! In-memory backend for tests and development deployments
//!
//! Models a small cluster with per-node capacity accounting. Containers
//! are bookkeeping entries only; nothing is executed.

use crate::error::{BackendError, Result};
use crate::stats::{ClusterStats, ImageInventory, NodeStats, NodeStatus};
use crate::{ContainerBackend, ContainerHandle, ContainerOptions, PortBinding};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

/// Static description of one simulated node
#[derive(Debug, Clone)]
pub struct SimulatedNodeSpec {
    pub name: String,
    pub memory_total: i64,
    pub cores_total: f64,
    pub labels: BTreeSet<String>,
    pub images: Vec<ImageInventory>,
    pub status: NodeStatus,

    /// Containers present before Zoe starts placing anything, for
    /// shared clusters
    pub preexisting_containers: usize,
}

impl SimulatedNodeSpec {
    pub fn new(name: impl Into<String>, memory_total: i64, cores_total: f64) -> Self {
        Self {
            name: name.into(),
            memory_total,
            cores_total,
            labels: BTreeSet::new(),
            images: Vec::new(),
            status: NodeStatus::Online,
            preexisting_containers: 0,
        }
    }

    pub fn with_labels<I: IntoIterator<Item = S>, S: Into<String>>(mut self, labels: I) -> Self {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_images<I: IntoIterator<Item = S>, S: Into<String>>(mut self, images: I) -> Self {
        self.images = images
            .into_iter()
            .map(|name| ImageInventory {
                names: vec![name.into()],
            })
            .collect();
        self
    }

    pub fn with_preexisting_containers(mut self, count: usize) -> Self {
        self.preexisting_containers = count;
        self
    }
}

struct NodeState {
    spec: SimulatedNodeSpec,
    external_ip: String,
    memory_reserved: i64,
    cores_reserved: f64,
    container_count: usize,
}

struct SimContainer {
    node: String,
    memory: i64,
    cores: f64,
}

/// In-memory implementation of [`ContainerBackend`]
pub struct SimulatedBackend {
    nodes: RwLock<Vec<NodeState>>,
    containers: DashMap<String, SimContainer>,
    fail_create: AtomicBool,
    next_port: AtomicU32,
}

impl SimulatedBackend {
    pub fn new(specs: Vec<SimulatedNodeSpec>) -> Self {
        let nodes = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| NodeState {
                external_ip: format!("172.16.0.{}", i + 1),
                memory_reserved: 0,
                cores_reserved: 0.0,
                container_count: spec.preexisting_containers,
                spec,
            })
            .collect();
        Self {
            nodes: RwLock::new(nodes),
            containers: DashMap::new(),
            fail_create: AtomicBool::new(false),
            next_port: AtomicU32::new(32768),
        }
    }

    /// Make every subsequent `create_container` fail, until reset.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Flip a node online/offline.
    pub fn set_node_status(&self, node: &str, status: NodeStatus) {
        let mut nodes = self.nodes.write();
        if let Some(state) = nodes.iter_mut().find(|n| n.spec.name == node) {
            state.spec.status = status;
        }
    }

    /// Number of live simulated containers.
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn has_container(&self, container_id: &str) -> bool {
        self.containers.contains_key(container_id)
    }

    /// Containers currently accounted to a node.
    pub fn node_container_count(&self, node: &str) -> usize {
        self.nodes
            .read()
            .iter()
            .find(|n| n.spec.name == node)
            .map(|n| n.container_count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContainerBackend for SimulatedBackend {
    async fn create_container(
        &self,
        options: &ContainerOptions,
        node: &str,
    ) -> Result<ContainerHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::CreateFailed {
                node: node.to_string(),
                message: "injected failure".to_string(),
            });
        }

        let mut nodes = self.nodes.write();
        let state = nodes
            .iter_mut()
            .find(|n| n.spec.name == node)
            .ok_or_else(|| BackendError::NodeNotFound {
                node: node.to_string(),
            })?;
        if state.spec.status == NodeStatus::Offline {
            return Err(BackendError::CreateFailed {
                node: node.to_string(),
                message: "node is offline".to_string(),
            });
        }

        let container_id = uuid::Uuid::new_v4().simple().to_string();
        let ports = options
            .ports
            .iter()
            .map(|request| PortBinding {
                internal_name: request.internal_name.clone(),
                external_ip: state.external_ip.clone(),
                external_port: self.next_port.fetch_add(1, Ordering::SeqCst) as u16,
            })
            .collect();

        state.memory_reserved += options.memory_limit;
        state.cores_reserved += options.cores_limit;
        state.container_count += 1;
        self.containers.insert(
            container_id.clone(),
            SimContainer {
                node: node.to_string(),
                memory: options.memory_limit,
                cores: options.cores_limit,
            },
        );

        debug!(%container_id, node, name = %options.name, "container created");
        Ok(ContainerHandle {
            container_id,
            ports,
        })
    }

    async fn destroy_container(&self, container_id: &str) -> Result<()> {
        if let Some((_, container)) = self.containers.remove(container_id) {
            let mut nodes = self.nodes.write();
            if let Some(state) = nodes.iter_mut().find(|n| n.spec.name == container.node) {
                state.memory_reserved -= container.memory;
                state.cores_reserved -= container.cores;
                state.container_count = state.container_count.saturating_sub(1);
            }
            debug!(container_id, "container destroyed");
        }
        // destroying an unknown container is a success
        Ok(())
    }

    async fn list_images(&self, node: &str) -> Result<Vec<ImageInventory>> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .find(|n| n.spec.name == node)
            .map(|n| n.spec.images.clone())
            .ok_or_else(|| BackendError::NodeNotFound {
                node: node.to_string(),
            })
    }

    async fn snapshot_cluster(&self) -> Result<ClusterStats> {
        let nodes = self.nodes.read();
        let stats = nodes
            .iter()
            .map(|n| NodeStats {
                name: n.spec.name.clone(),
                status: n.spec.status,
                memory_total: n.spec.memory_total,
                memory_reserved: n.memory_reserved,
                cores_total: n.spec.cores_total,
                cores_reserved: n.cores_reserved,
                container_count: n.container_count,
                labels: n.spec.labels.clone(),
                images: n.spec.images.clone(),
            })
            .collect();
        Ok(ClusterStats::new(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn options(memory: i64, cores: f64) -> ContainerOptions {
        ContainerOptions {
            name: "zoe-1-svc".to_string(),
            image: "img:1".to_string(),
            environment: Vec::new(),
            volumes: Vec::new(),
            command: None,
            labels: Default::default(),
            memory_limit: memory,
            cores_limit: cores,
            ports: vec![crate::PortRequest {
                internal_name: "8080/tcp".to_string(),
                number: 8080,
            }],
        }
    }

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(vec![
            SimulatedNodeSpec::new("node0", 4 * GIB, 4.0).with_images(["img:1"])
        ])
    }

    #[tokio::test]
    async fn create_accounts_reservations() {
        let backend = backend();
        let handle = backend
            .create_container(&options(GIB, 1.0), "node0")
            .await
            .unwrap();
        assert_eq!(handle.ports.len(), 1);
        assert!(handle.ports[0].external_port >= 32768);

        let stats = backend.snapshot_cluster().await.unwrap();
        assert_eq!(stats.nodes[0].memory_reserved, GIB);
        assert_eq!(stats.nodes[0].container_count, 1);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let backend = backend();
        let handle = backend
            .create_container(&options(GIB, 1.0), "node0")
            .await
            .unwrap();

        backend.destroy_container(&handle.container_id).await.unwrap();
        backend.destroy_container(&handle.container_id).await.unwrap();
        backend.destroy_container("no-such-id").await.unwrap();

        let stats = backend.snapshot_cluster().await.unwrap();
        assert_eq!(stats.nodes[0].memory_reserved, 0);
        assert_eq!(stats.nodes[0].container_count, 0);
    }

    #[tokio::test]
    async fn unknown_node_is_an_error() {
        let backend = backend();
        assert!(matches!(
            backend
                .create_container(&options(GIB, 1.0), "nowhere")
                .await
                .unwrap_err(),
            BackendError::NodeNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn injected_create_failures() {
        let backend = backend();
        backend.set_fail_create(true);
        assert!(backend
            .create_container(&options(GIB, 1.0), "node0")
            .await
            .is_err());
        backend.set_fail_create(false);
        assert!(backend
            .create_container(&options(GIB, 1.0), "node0")
            .await
            .is_ok());
    }
}
