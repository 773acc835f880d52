//! Zoe Scheduler - The execution engine of a Zoe deployment
//!
//! This crate contains:
//! - The placement simulator used to reason about hypothetical
//!   placements without touching the real cluster
//! - The scheduler actor: a single serial task owning the ready queue,
//!   the running set and the committed placement map
//! - Ingest of container events reported by the external observer
//!
//! All scheduler operations are serialized on the actor's command
//! channel, so placement passes never interleave.

pub mod error;
pub mod ingest;
pub mod simulator;
pub mod stats;

pub use error::{Result, SchedulerError};
pub use ingest::{BackendEvent, EventIngest};
pub use simulator::{SimulatedPlatform, UnfitReason};
pub use stats::{NodeSchedulerStats, SchedulerStats, ServiceSlotStats};

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use zoe_backend::{
    ClusterStatsProvider, ContainerBackend, ContainerOptions, PortRequest, VolumeBind,
};
use zoe_shared::ZoeConfig;
use zoe_state::{
    BackendStatus, Caller, Execution, ExecutionStatus, Service, ServiceStatus, StateStore,
};

pub(crate) enum Command {
    Submit {
        execution_id: i64,
    },
    Terminate {
        execution_id: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    ContainerDied {
        service_id: i64,
    },
    Tick,
    Statistics {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown,
}

/// Cloneable handle used by the facade and the event ingest to talk to
/// the scheduler actor
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Handle without a running actor behind it, for tests.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (Self { commands }, receiver)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Unreachable)
    }

    /// Enqueue an execution for placement.
    pub fn submit(&self, execution_id: i64) -> Result<()> {
        self.send(Command::Submit { execution_id })
    }

    /// Terminate an execution; returns once the actor has processed the
    /// command. Container destruction may still be retried afterwards.
    pub async fn terminate(&self, execution_id: i64) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Terminate {
            execution_id,
            reply,
        })?;
        response.await.map_err(|_| SchedulerError::Unreachable)?
    }

    /// Report that a Zoe container died.
    pub fn container_died(&self, service_id: i64) -> Result<()> {
        self.send(Command::ContainerDied { service_id })
    }

    /// Trigger a scheduling pass.
    pub fn tick(&self) -> Result<()> {
        self.send(Command::Tick)
    }

    pub async fn statistics(&self) -> Result<SchedulerStats> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Statistics { reply })?;
        response.await.map_err(|_| SchedulerError::Unreachable)
    }

    /// Ask the actor to exit after the current command.
    pub fn shutdown(&self) {
        let _ = self.send(Command::Shutdown);
    }
}

/// Start the scheduler actor.
///
/// Returns the handle used to reach it and the join handle of its task.
pub fn spawn(
    store: Arc<StateStore>,
    backend: Arc<dyn ContainerBackend>,
    provider: Arc<ClusterStatsProvider>,
    config: ZoeConfig,
) -> (SchedulerHandle, tokio::task::JoinHandle<()>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let scheduler = ZoeScheduler {
        store,
        backend,
        provider,
        backend_timeout: config.scheduler.backend_timeout(),
        config,
        caller: Caller::system(),
        queue: VecDeque::new(),
        running: BTreeSet::new(),
        committed: BTreeMap::new(),
        pending_destroy: Vec::new(),
        pass_count: 0,
        termination_count: 0,
    };
    let task = tokio::spawn(scheduler.run(receiver));
    (SchedulerHandle { commands }, task)
}

/// The serial scheduling actor
struct ZoeScheduler {
    store: Arc<StateStore>,
    backend: Arc<dyn ContainerBackend>,
    provider: Arc<ClusterStatsProvider>,
    config: ZoeConfig,
    backend_timeout: Duration,
    caller: Caller,

    /// FIFO queue of executions awaiting essential placement
    queue: VecDeque<i64>,

    /// Executions with committed placements
    running: BTreeSet<i64>,

    /// Committed placement map: service id to node name
    committed: BTreeMap<i64, String>,

    /// Containers whose destruction failed; retried every pass
    pending_destroy: Vec<String>,

    pass_count: u64,
    termination_count: u64,
}

impl ZoeScheduler {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("scheduler started");
        while let Some(command) = commands.recv().await {
            match command {
                Command::Submit { execution_id } => {
                    self.handle_submit(execution_id);
                    self.schedule_pass().await;
                }
                Command::Terminate {
                    execution_id,
                    reply,
                } => {
                    let result = self.terminate_execution(execution_id).await;
                    let _ = reply.send(result);
                    self.schedule_pass().await;
                }
                Command::ContainerDied { service_id } => {
                    self.handle_container_died(service_id).await;
                    self.schedule_pass().await;
                }
                Command::Tick => self.schedule_pass().await,
                Command::Statistics { reply } => {
                    let _ = reply.send(self.statistics());
                }
                Command::Shutdown => break,
            }
        }
        info!("scheduler stopped");
    }

    fn handle_submit(&mut self, execution_id: i64) {
        match self
            .store
            .set_execution_status(&self.caller, execution_id, ExecutionStatus::Scheduled)
        {
            Ok(()) => {
                self.queue.push_back(execution_id);
                info!(execution_id, "execution queued for placement");
            }
            Err(err) => warn!(execution_id, %err, "cannot queue execution"),
        }
    }

    async fn handle_container_died(&mut self, service_id: i64) {
        let service = match self.store.service_by_id(&self.caller, service_id) {
            Ok(service) => service,
            Err(err) if err.is_not_found() => {
                // the observer reports deaths of containers Zoe no
                // longer knows about, e.g. after a terminate
                debug!(service_id, "die event for unknown container");
                return;
            }
            Err(err) => {
                warn!(service_id, %err, "cannot look up died service");
                return;
            }
        };

        if service.monitor() {
            info!(
                execution_id = service.execution_id,
                service_id, "monitor service died, terminating execution"
            );
            if let Err(err) = self.terminate_execution(service.execution_id).await {
                warn!(execution_id = service.execution_id, %err, "termination after monitor death failed");
            }
            return;
        }

        debug!(service_id, "service died, eligible for rescheduling");
        if let Err(err) =
            self.store
                .set_service_backend_status(&self.caller, service_id, BackendStatus::Die)
        {
            warn!(service_id, %err, "cannot record service death");
        }
        self.committed.remove(&service_id);
        if let Some(container_id) = service.container_id {
            // the container is gone, but ask the backend anyway so its
            // record is cleaned up; destroy is idempotent
            self.pending_destroy.push(container_id);
        }
    }

    async fn terminate_execution(&mut self, execution_id: i64) -> Result<()> {
        let execution = self.store.execution_by_id(&self.caller, execution_id)?;
        if !execution.is_active() {
            return Err(SchedulerError::invalid_state(format!(
                "execution {} is not active",
                execution_id
            )));
        }

        self.store
            .set_execution_status(&self.caller, execution_id, ExecutionStatus::CleaningUp)?;
        let services = self.store.services_of_execution(&self.caller, execution_id)?;

        let targets: Vec<String> = services
            .iter()
            .filter_map(|s| s.container_id.clone())
            .collect();
        let backend = self.backend.clone();
        let timeout = self.backend_timeout;
        let destructions = targets.iter().map(|container_id| {
            let backend = backend.clone();
            async move {
                let outcome =
                    tokio::time::timeout(timeout, backend.destroy_container(container_id)).await;
                (container_id.clone(), outcome)
            }
        });
        for (container_id, outcome) in join_all(destructions).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(%container_id, %err, "container destruction failed, will retry");
                    self.pending_destroy.push(container_id);
                }
                Err(_) => {
                    warn!(%container_id, "container destruction timed out, will retry");
                    self.pending_destroy.push(container_id);
                }
            }
        }

        for service in &services {
            self.committed.remove(&service.id);
            if let Err(err) =
                self.store
                    .set_service_status(&self.caller, service.id, ServiceStatus::Inactive)
            {
                warn!(service_id = service.id, %err, "cannot deactivate service");
            }
            let _ = self.store.clear_service_assignment(&self.caller, service.id);
            let _ = self.store.delete_ports_of_service(&self.caller, service.id);
        }

        self.queue.retain(|&id| id != execution_id);
        self.running.remove(&execution_id);
        self.store
            .set_execution_status(&self.caller, execution_id, ExecutionStatus::Terminated)?;
        self.termination_count += 1;
        info!(execution_id, "execution terminated");
        Ok(())
    }

    /// One scheduling pass: simulate, place, diff, command the backend.
    async fn schedule_pass(&mut self) {
        self.retry_pending_destroy().await;

        let snapshot = match self.provider.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(%err, "no cluster snapshot, skipping scheduling pass");
                return;
            }
        };

        let mut sim = SimulatedPlatform::new(&snapshot);
        for (&service_id, node) in &self.committed {
            sim.replay(service_id, node);
        }

        // essential placement for queued executions, in FIFO order
        let queued: Vec<i64> = self.queue.iter().copied().collect();
        let mut admitted = Vec::new();
        for execution_id in queued {
            let services = match self.store.services_of_execution(&self.caller, execution_id) {
                Ok(services) => services,
                Err(err) => {
                    warn!(execution_id, %err, "cannot load services, dropping from queue");
                    self.queue.retain(|&id| id != execution_id);
                    let _ = self.store.set_execution_status(
                        &self.caller,
                        execution_id,
                        ExecutionStatus::Error,
                    );
                    continue;
                }
            };
            if sim.allocate_essential(&services) {
                admitted.push(execution_id);
            } else {
                debug!(execution_id, "insufficient capacity, execution stays queued");
            }
        }
        for &execution_id in &admitted {
            self.queue.retain(|&id| id != execution_id);
            self.running.insert(execution_id);
            if let Err(err) =
                self.store
                    .set_execution_status(&self.caller, execution_id, ExecutionStatus::Starting)
            {
                warn!(execution_id, %err, "cannot mark execution starting");
            }
        }

        // repair and opportunistic placement for running executions
        let running: Vec<i64> = self.running.iter().copied().collect();
        for execution_id in running {
            let services = match self.store.services_of_execution(&self.caller, execution_id) {
                Ok(services) => services,
                Err(err) => {
                    warn!(execution_id, %err, "cannot load services of running execution");
                    continue;
                }
            };
            // a starting execution may still have unplaced essential
            // services after a create failure; try them again first
            sim.allocate_essential(&services);
            sim.allocate_elastic(&services);
        }

        let target = sim.get_service_allocation();
        self.apply_placement(target).await;
        self.finalize_started_executions();

        self.pass_count += 1;
        debug!(
            pass = self.pass_count,
            queued = self.queue.len(),
            running = self.running.len(),
            "scheduling pass complete"
        );
    }

    /// Diff the target placement against the committed one and command
    /// the backend accordingly.
    async fn apply_placement(&mut self, target: BTreeMap<i64, String>) {
        let mut added: Vec<(Service, String)> = Vec::new();
        for (service_id, node) in &target {
            if self.committed.get(service_id) != Some(node) {
                match self.store.service_by_id(&self.caller, *service_id) {
                    Ok(service) => added.push((service, node.clone())),
                    Err(err) => warn!(service_id, %err, "placed service vanished from the store"),
                }
            }
        }
        added.sort_by_key(|(service, _)| (service.execution_id, service.startup_order(), service.id));

        let removed: Vec<(i64, String)> = self
            .committed
            .iter()
            .filter(|(service_id, _)| !target.contains_key(*service_id))
            .map(|(service_id, node)| (*service_id, node.clone()))
            .collect();

        for (service, node) in added {
            self.start_service(service, &node).await;
        }

        for (service_id, node) in removed {
            debug!(service_id, %node, "placement revoked, destroying container");
            self.committed.remove(&service_id);
            if let Ok(service) = self.store.service_by_id(&self.caller, service_id) {
                if let Some(container_id) = service.container_id {
                    if !self.destroy_container(&container_id).await {
                        self.pending_destroy.push(container_id);
                    }
                }
            }
            let _ = self
                .store
                .set_service_status(&self.caller, service_id, ServiceStatus::Inactive);
            let _ = self.store.clear_service_assignment(&self.caller, service_id);
        }
    }

    /// Create and start one container; on failure the service reverts to
    /// not placed and will be retried on a later pass.
    async fn start_service(&mut self, service: Service, node: &str) {
        let execution = match self.store.execution_by_id(&self.caller, service.execution_id) {
            Ok(execution) => execution,
            Err(err) => {
                warn!(service_id = service.id, %err, "cannot load execution of placed service");
                return;
            }
        };

        if let Err(err) =
            self.store
                .set_service_status(&self.caller, service.id, ServiceStatus::Runnable)
        {
            warn!(service_id = service.id, %err, "cannot mark service runnable");
            return;
        }

        let options = container_options(&self.config, &execution, &service);
        let created =
            tokio::time::timeout(self.backend_timeout, self.backend.create_container(&options, node))
                .await;
        let handle = match created {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                warn!(service_id = service.id, node, %err, "container creation failed");
                let _ = self
                    .store
                    .set_service_status(&self.caller, service.id, ServiceStatus::Inactive);
                return;
            }
            Err(_) => {
                warn!(service_id = service.id, node, "container creation timed out");
                let _ = self
                    .store
                    .set_service_status(&self.caller, service.id, ServiceStatus::Inactive);
                return;
            }
        };

        if let Err(err) =
            self.store
                .assign_service(&self.caller, service.id, node, &handle.container_id)
        {
            warn!(service_id = service.id, %err, "cannot record container assignment");
            if !self.destroy_container(&handle.container_id).await {
                self.pending_destroy.push(handle.container_id);
            }
            let _ = self
                .store
                .set_service_status(&self.caller, service.id, ServiceStatus::Inactive);
            return;
        }

        let _ = self
            .store
            .set_service_backend_status(&self.caller, service.id, BackendStatus::Started);
        let _ = self
            .store
            .set_service_status(&self.caller, service.id, ServiceStatus::Active);
        let _ = self.store.delete_ports_of_service(&self.caller, service.id);
        for binding in &handle.ports {
            if let Err(err) = self.store.insert_port(
                &self.caller,
                service.id,
                &binding.internal_name,
                Some(binding.external_ip.clone()),
                Some(binding.external_port),
            ) {
                warn!(service_id = service.id, %err, "cannot record port binding");
            }
        }
        self.committed.insert(service.id, node.to_string());
        info!(
            service_id = service.id,
            node,
            container_id = %handle.container_id,
            "service started"
        );
    }

    /// Move starting executions whose essential services are all active
    /// to running.
    fn finalize_started_executions(&mut self) {
        let running: Vec<i64> = self.running.iter().copied().collect();
        for execution_id in running {
            let execution = match self.store.execution_by_id(&self.caller, execution_id) {
                Ok(execution) => execution,
                Err(_) => continue,
            };
            if !matches!(
                execution.status,
                ExecutionStatus::Starting | ExecutionStatus::ImageDownload
            ) {
                continue;
            }
            let services = match self.store.services_of_execution(&self.caller, execution_id) {
                Ok(services) => services,
                Err(_) => continue,
            };
            let all_essential_active = services
                .iter()
                .filter(|s| s.essential())
                .all(|s| s.status == ServiceStatus::Active);
            if all_essential_active {
                if let Err(err) = self.store.set_execution_status(
                    &self.caller,
                    execution_id,
                    ExecutionStatus::Running,
                ) {
                    warn!(execution_id, %err, "cannot mark execution running");
                } else {
                    info!(execution_id, "execution is running");
                }
            }
        }
    }

    async fn retry_pending_destroy(&mut self) {
        if self.pending_destroy.is_empty() {
            return;
        }
        let targets = std::mem::take(&mut self.pending_destroy);
        for container_id in targets {
            if !self.destroy_container(&container_id).await {
                self.pending_destroy.push(container_id);
            }
        }
    }

    async fn destroy_container(&self, container_id: &str) -> bool {
        match tokio::time::timeout(
            self.backend_timeout,
            self.backend.destroy_container(container_id),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(container_id, %err, "container destruction failed");
                false
            }
            Err(_) => {
                warn!(container_id, "container destruction timed out");
                false
            }
        }
    }

    fn statistics(&self) -> SchedulerStats {
        let mut per_node: BTreeMap<String, NodeSchedulerStats> = BTreeMap::new();
        for (service_id, node) in &self.committed {
            let entry = per_node
                .entry(node.clone())
                .or_insert_with(|| NodeSchedulerStats {
                    name: node.clone(),
                    service_stats: BTreeMap::new(),
                });
            if let Ok(service) = self.store.service_by_id(&self.caller, *service_id) {
                let reservation = service.resource_reservation();
                entry.service_stats.insert(
                    *service_id,
                    ServiceSlotStats {
                        memory_min: reservation.memory.min,
                        cores_min: reservation.cores.min,
                    },
                );
            }
        }
        SchedulerStats {
            queue_length: self.queue.len(),
            running_executions: self.running.len(),
            pass_count: self.pass_count,
            termination_count: self.termination_count,
            node_stats: per_node.into_values().collect(),
        }
    }
}

/// Build the backend container configuration for one service.
fn container_options(config: &ZoeConfig, execution: &Execution, service: &Service) -> ContainerOptions {
    let mut labels = HashMap::new();
    labels.insert(
        "zoe.prefix".to_string(),
        config.container_name_prefix.clone(),
    );
    labels.insert("zoe.container.id".to_string(), service.id.to_string());
    labels.insert("zoe.execution.id".to_string(), execution.id.to_string());
    labels.insert(
        "zoe.deployment.name".to_string(),
        config.deployment_name.clone(),
    );

    let description = &service.description;
    ContainerOptions {
        name: format!(
            "{}-{}-{}",
            config.container_name_prefix, execution.id, service.name
        ),
        image: description.image.clone(),
        environment: description.environment.clone(),
        volumes: description
            .volumes
            .iter()
            .map(|v| VolumeBind {
                host_path: v.host_path.clone(),
                container_path: v.container_path.clone(),
                read_only: v.read_only,
            })
            .collect(),
        command: description.command.clone(),
        labels,
        memory_limit: description.resources.memory.min,
        cores_limit: description.resources.cores.min,
        ports: description
            .ports
            .iter()
            .map(|p| PortRequest {
                internal_name: p.internal_name(),
                number: p.port_number,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use zoe_state::application::{
        ApplicationDescription, PortDescription, PortProtocol, ResourceReservation,
        ServiceDescription,
    };

    #[test]
    fn container_options_carry_zoe_labels() {
        let config = ZoeConfig::default();
        let description = ServiceDescription {
            name: "master".to_string(),
            image: "img:1".to_string(),
            monitor: true,
            essential: true,
            resources: ResourceReservation::new(1024, 1.0),
            labels: BTreeSet::new(),
            ports: vec![PortDescription {
                name: "web".to_string(),
                port_number: 8080,
                protocol: PortProtocol::Tcp,
                url_template: None,
            }],
            environment: vec![("KEY".to_string(), "value".to_string())],
            volumes: Vec::new(),
            command: None,
            startup_order: 0,
        };
        let execution = Execution {
            id: 3,
            name: "e".to_string(),
            user_id: "alice".to_string(),
            status: ExecutionStatus::Starting,
            description: ApplicationDescription {
                name: "app".to_string(),
                version: 1,
                will_end: false,
                services: vec![description.clone()],
            },
            time_submit: chrono::Utc::now(),
            time_start: None,
            time_end: None,
        };
        let service = Service {
            id: 9,
            execution_id: 3,
            user_id: "alice".to_string(),
            name: "master".to_string(),
            status: ServiceStatus::Inactive,
            backend_status: BackendStatus::Undefined,
            backend_host: None,
            container_id: None,
            description,
        };

        let options = container_options(&config, &execution, &service);
        assert_eq!(options.name, "zoe-3-master");
        assert_eq!(options.labels["zoe.container.id"], "9");
        assert_eq!(options.labels["zoe.prefix"], "zoe");
        assert_eq!(options.ports[0].internal_name, "8080/tcp");
        assert_eq!(options.memory_limit, 1024);
    }
}
