//! What-if placement model used by the scheduler
//!
//! A [`SimulatedPlatform`] is built from one cluster snapshot at the start
//! of every scheduling pass and discarded at the end; it is never shared
//! across passes. Hypothetical placements consume simulated capacity;
//! placements replayed from the previous pass do not, because the real
//! node statistics already account for their running containers.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use zoe_backend::{ClusterStats, ImageInventory, NodeStats, NodeStatus};
use zoe_state::{BackendStatus, Service, ServiceStatus};

/// First predicate that disqualifies a service from a node.
///
/// The check order (memory, cores, labels, image) is relied upon by
/// operators reading scheduler diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum UnfitReason {
    Memory { missing: i64 },
    Cores { missing: f64 },
    Labels { required: Vec<String> },
    Image { image: String },
}

impl std::fmt::Display for UnfitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnfitReason::Memory { missing } => {
                write!(f, "needs {} more bytes of memory", missing)
            }
            UnfitReason::Cores { missing } => write!(f, "needs {} more cores", missing),
            UnfitReason::Labels { required } => {
                write!(f, "requires labels {:?} to be defined on the node", required)
            }
            UnfitReason::Image { image } => {
                write!(f, "image {} is not available on this node", image)
            }
        }
    }
}

struct Placement {
    service_id: i64,
    memory_min: i64,
    cores_min: f64,
}

/// A simulated node where containers can be hypothetically run
pub struct SimulatedNode {
    name: String,
    labels: std::collections::BTreeSet<String>,
    images: Vec<ImageInventory>,
    real_free_memory: i64,
    real_free_cores: f64,
    real_active_containers: usize,
    placed: Vec<Placement>,
}

impl SimulatedNode {
    fn new(real: &NodeStats) -> Self {
        Self {
            name: real.name.clone(),
            labels: real.labels.clone(),
            images: real.images.clone(),
            real_free_memory: real.memory_free(),
            real_free_cores: real.cores_free(),
            real_active_containers: real.container_count,
            placed: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Real active containers plus simulated placements.
    pub fn container_count(&self) -> usize {
        self.real_active_containers + self.placed.len()
    }

    /// Free memory after simulated placements.
    ///
    /// A negative value means more memory is reserved than the node has;
    /// it is logged and still returned so higher layers can detect the
    /// condition.
    pub fn free_memory(&self) -> i64 {
        let simulated: i64 = self.placed.iter().map(|p| p.memory_min).sum();
        let free = self.real_free_memory - simulated;
        if free < 0 {
            warn!(node = %self.name, free, "more memory reserved than there is free");
        }
        free
    }

    /// Free cores after simulated placements.
    pub fn free_cores(&self) -> f64 {
        let simulated: f64 = self.placed.iter().map(|p| p.cores_min).sum();
        let free = self.real_free_cores - simulated;
        if free < 0.0 {
            warn!(node = %self.name, free, "more cores reserved than there are free");
        }
        free
    }

    fn image_available(&self, image: &str) -> bool {
        self.images.iter().any(|group| group.contains(image))
    }

    /// Whether the service can fit on this node.
    ///
    /// Memory uses strict `<`, cores non-strict `<=`; the asymmetry is
    /// part of the placement contract.
    pub fn fits(&self, service: &Service) -> bool {
        let reservation = service.resource_reservation();
        service.labels().is_subset(&self.labels)
            && reservation.memory.min < self.free_memory()
            && reservation.cores.min <= self.free_cores()
            && self.image_available(service.image_name())
    }

    /// The first failing predicate, in the order memory, cores, labels,
    /// image. `None` when the service fits.
    pub fn why_unfit(&self, service: &Service) -> Option<UnfitReason> {
        let reservation = service.resource_reservation();
        if reservation.memory.min >= self.free_memory() {
            return Some(UnfitReason::Memory {
                missing: reservation.memory.min - self.free_memory(),
            });
        }
        if reservation.cores.min > self.free_cores() {
            return Some(UnfitReason::Cores {
                missing: reservation.cores.min - self.free_cores(),
            });
        }
        if !service.labels().is_subset(&self.labels) {
            return Some(UnfitReason::Labels {
                required: service.labels().iter().cloned().collect(),
            });
        }
        if !self.image_available(service.image_name()) {
            return Some(UnfitReason::Image {
                image: service.image_name().to_string(),
            });
        }
        None
    }

    fn add(&mut self, service: &Service) {
        let reservation = service.resource_reservation();
        self.placed.push(Placement {
            service_id: service.id,
            memory_min: reservation.memory.min,
            cores_min: reservation.cores.min,
        });
    }

    fn remove(&mut self, service_id: i64) -> bool {
        let before = self.placed.len();
        self.placed.retain(|p| p.service_id != service_id);
        self.placed.len() != before
    }

    fn holds(&self, service_id: i64) -> bool {
        self.placed.iter().any(|p| p.service_id == service_id)
    }
}

/// A simulated cluster, composed of the online nodes of one snapshot
pub struct SimulatedPlatform {
    nodes: Vec<SimulatedNode>,
    /// Placements carried over from the previous pass; the real node
    /// statistics already include their containers.
    replayed: BTreeMap<i64, String>,
}

impl SimulatedPlatform {
    pub fn new(snapshot: &ClusterStats) -> Self {
        let nodes = snapshot
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Online)
            .map(SimulatedNode::new)
            .collect();
        Self {
            nodes,
            replayed: BTreeMap::new(),
        }
    }

    pub fn nodes(&self) -> &[SimulatedNode] {
        &self.nodes
    }

    /// Register an already-running service without consuming simulated
    /// capacity.
    pub fn replay(&mut self, service_id: i64, node: &str) {
        self.replayed.insert(service_id, node.to_string());
    }

    fn is_allocated(&self, service_id: i64) -> bool {
        self.replayed.contains_key(&service_id) || self.nodes.iter().any(|n| n.holds(service_id))
    }

    /// Index of the fitting node with the smallest container count; ties
    /// go to the node seen first in snapshot order.
    fn select_node(&self, service: &Service) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, node) in self.nodes.iter().enumerate() {
            if node.fits(service) {
                let better = match best {
                    Some(current) => {
                        node.container_count() < self.nodes[current].container_count()
                    }
                    None => true,
                };
                if better {
                    best = Some(index);
                }
            } else if let Some(reason) = node.why_unfit(service) {
                debug!(
                    service_id = service.id,
                    node = %node.name,
                    %reason,
                    "service does not fit on node"
                );
            }
        }
        best
    }

    fn in_startup_order<'a>(services: &'a [Service], essential: bool) -> Vec<&'a Service> {
        let mut subset: Vec<&Service> = services
            .iter()
            .filter(|s| s.essential() == essential)
            .collect();
        subset.sort_by_key(|s| (s.startup_order(), s.id));
        subset
    }

    /// Place every essential service of the execution that is not
    /// allocated yet, or none of them.
    ///
    /// On failure only the placements made by this call are rolled back,
    /// so placements replayed from earlier passes survive a failed
    /// repair attempt.
    pub fn allocate_essential(&mut self, services: &[Service]) -> bool {
        let mut placed_now = Vec::new();
        for service in Self::in_startup_order(services, true) {
            if self.is_allocated(service.id) {
                continue;
            }
            match self.select_node(service) {
                Some(index) => {
                    self.nodes[index].add(service);
                    placed_now.push(service.id);
                }
                None => {
                    info!(
                        service_id = service.id,
                        "cannot fit essential service anywhere, bailing out"
                    );
                    for service_id in placed_now {
                        self.remove_placement(service_id);
                    }
                    return false;
                }
            }
        }
        true
    }

    fn remove_placement(&mut self, service_id: i64) {
        for node in &mut self.nodes {
            if node.remove(service_id) {
                break;
            }
        }
    }

    /// Remove the execution's essential services wherever placed.
    pub fn deallocate_essential(&mut self, services: &[Service]) {
        for service in services.iter().filter(|s| s.essential()) {
            self.replayed.remove(&service.id);
            for node in &mut self.nodes {
                if node.remove(service.id) {
                    break;
                }
            }
        }
    }

    /// Opportunistically place the execution's elastic services.
    ///
    /// A service that is active and has not been observed to die keeps
    /// its placement and is skipped; everything else is eligible.
    /// Returns the ids of newly placed services.
    pub fn allocate_elastic(&mut self, services: &[Service]) -> Vec<i64> {
        let mut newly_placed = Vec::new();
        for service in Self::in_startup_order(services, false) {
            if service.status == ServiceStatus::Active
                && service.backend_status != BackendStatus::Die
            {
                continue;
            }
            if self.is_allocated(service.id) {
                continue;
            }
            match self.select_node(service) {
                Some(index) => {
                    self.nodes[index].add(service);
                    newly_placed.push(service.id);
                }
                None => {
                    info!(
                        service_id = service.id,
                        "cannot fit elastic service anywhere"
                    );
                }
            }
        }
        newly_placed
    }

    /// Remove the execution's elastic services wherever placed, returning
    /// the ids that should be marked inactive.
    pub fn deallocate_elastic(&mut self, services: &[Service]) -> Vec<i64> {
        let mut removed = Vec::new();
        for service in services.iter().filter(|s| !s.essential()) {
            let mut dropped = self.replayed.remove(&service.id).is_some();
            for node in &mut self.nodes {
                if node.remove(service.id) {
                    dropped = true;
                    break;
                }
            }
            if dropped {
                removed.push(service.id);
            }
        }
        removed
    }

    /// Map of service id to the node it is allocated on, replayed and
    /// hypothetical placements combined.
    pub fn get_service_allocation(&self) -> BTreeMap<i64, String> {
        let mut allocation = self.replayed.clone();
        for node in &self.nodes {
            for placement in &node.placed {
                allocation.insert(placement.service_id, node.name.clone());
            }
        }
        allocation
    }

    /// Free memory summed across all online nodes.
    pub fn aggregated_free_memory(&self) -> i64 {
        self.nodes.iter().map(|n| n.free_memory()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use zoe_backend::NodeStats;
    use zoe_state::application::{ResourceReservation, ServiceDescription};

    const GIB: i64 = 1024 * 1024 * 1024;

    fn node(name: &str, free_memory: i64, free_cores: f64) -> NodeStats {
        NodeStats {
            name: name.to_string(),
            status: NodeStatus::Online,
            memory_total: free_memory,
            memory_reserved: 0,
            cores_total: free_cores,
            cores_reserved: 0.0,
            container_count: 0,
            labels: BTreeSet::new(),
            images: vec![ImageInventory {
                names: vec!["img:1".to_string()],
            }],
        }
    }

    fn service(id: i64, essential: bool, memory: i64, cores: f64) -> Service {
        Service {
            id,
            execution_id: 1,
            user_id: "alice".to_string(),
            name: format!("svc{}", id),
            status: ServiceStatus::Inactive,
            backend_status: BackendStatus::Undefined,
            backend_host: None,
            container_id: None,
            description: ServiceDescription {
                name: format!("svc{}", id),
                image: "img:1".to_string(),
                monitor: false,
                essential,
                resources: ResourceReservation::new(memory, cores),
                labels: BTreeSet::new(),
                ports: Vec::new(),
                environment: Vec::new(),
                volumes: Vec::new(),
                command: None,
                startup_order: 0,
            },
        }
    }

    fn platform(nodes: Vec<NodeStats>) -> SimulatedPlatform {
        SimulatedPlatform::new(&ClusterStats::new(nodes))
    }

    #[test]
    fn memory_is_strict_cores_are_not() {
        let sim = platform(vec![node("n0", 1024, 2.0)]);

        // memory.min == free memory does not fit
        assert!(!sim.nodes()[0].fits(&service(1, true, 1024, 1.0)));
        assert!(sim.nodes()[0].fits(&service(1, true, 1023, 1.0)));

        // cores.min == free cores does fit
        assert!(sim.nodes()[0].fits(&service(1, true, 512, 2.0)));
        assert!(!sim.nodes()[0].fits(&service(1, true, 512, 2.5)));
    }

    #[test]
    fn why_unfit_checks_memory_cores_labels_image_in_order() {
        let mut stats = node("n0", 1024, 1.0);
        stats.labels = BTreeSet::new();
        let sim = platform(vec![stats]);
        let n = &sim.nodes()[0];

        // memory and cores both short: memory wins
        let mut svc = service(1, true, 4096, 8.0);
        assert!(matches!(n.why_unfit(&svc), Some(UnfitReason::Memory { .. })));

        // cores short, labels missing: cores wins
        svc = service(1, true, 512, 8.0);
        svc.description.labels.insert("gpu".to_string());
        assert!(matches!(n.why_unfit(&svc), Some(UnfitReason::Cores { .. })));

        // labels missing, image missing: labels win
        svc = service(1, true, 512, 1.0);
        svc.description.labels.insert("gpu".to_string());
        svc.description.image = "other:1".to_string();
        assert!(matches!(n.why_unfit(&svc), Some(UnfitReason::Labels { .. })));

        // only the image is missing
        svc = service(1, true, 512, 1.0);
        svc.description.image = "other:1".to_string();
        assert!(matches!(n.why_unfit(&svc), Some(UnfitReason::Image { .. })));

        assert!(n.why_unfit(&service(1, true, 512, 1.0)).is_none());
    }

    #[test]
    fn image_match_is_exact() {
        let sim = platform(vec![node("n0", GIB, 4.0)]);
        let mut svc = service(1, true, 1024, 1.0);
        svc.description.image = "img".to_string();
        assert!(matches!(
            sim.nodes()[0].why_unfit(&svc),
            Some(UnfitReason::Image { .. })
        ));
    }

    #[test]
    fn smallest_container_count_wins() {
        let mut busy = node("busy", GIB, 4.0);
        busy.container_count = 5;
        let mut quiet = node("quiet", GIB, 4.0);
        quiet.container_count = 3;

        let mut sim = platform(vec![busy, quiet]);
        let services = vec![service(1, true, 1024, 1.0)];
        assert!(sim.allocate_essential(&services));
        assert_eq!(sim.get_service_allocation()[&1], "quiet");
    }

    #[test]
    fn ties_break_in_snapshot_order() {
        let mut sim = platform(vec![node("first", GIB, 4.0), node("second", GIB, 4.0)]);
        let services = vec![service(1, true, 1024, 1.0)];
        assert!(sim.allocate_essential(&services));
        assert_eq!(sim.get_service_allocation()[&1], "first");
    }

    #[test]
    fn essential_allocation_is_all_or_nothing() {
        // two services, capacity for only one
        let mut sim = platform(vec![node("n0", 2048, 4.0)]);
        let services = vec![
            service(1, true, 1500, 1.0),
            service(2, true, 1500, 1.0),
        ];
        assert!(!sim.allocate_essential(&services));
        assert!(sim.get_service_allocation().is_empty());
        assert_eq!(sim.aggregated_free_memory(), 2048);
    }

    #[test]
    fn deallocate_essential_clears_placements() {
        let mut sim = platform(vec![node("n0", GIB, 4.0)]);
        let services = vec![service(1, true, 1024, 1.0)];
        assert!(sim.allocate_essential(&services));
        assert_eq!(sim.get_service_allocation().len(), 1);

        sim.deallocate_essential(&services);
        assert!(sim.get_service_allocation().is_empty());
        assert_eq!(sim.aggregated_free_memory(), GIB);
    }

    #[test]
    fn failed_repair_keeps_replayed_placements() {
        let mut sim = platform(vec![node("n0", 2048, 4.0)]);
        sim.replay(1, "n0");

        // service 1 is already running, service 2 cannot fit anywhere
        let services = vec![service(1, true, 1024, 1.0), service(2, true, 4096, 1.0)];
        assert!(!sim.allocate_essential(&services));
        assert_eq!(sim.get_service_allocation().len(), 1);
        assert_eq!(sim.get_service_allocation()[&1], "n0");
    }

    #[test]
    fn offline_nodes_are_excluded() {
        let mut offline = node("off", GIB, 4.0);
        offline.status = NodeStatus::Offline;
        let mut sim = platform(vec![offline]);
        assert!(!sim.allocate_essential(&[service(1, true, 1024, 1.0)]));
    }

    #[test]
    fn elastic_skips_healthy_active_services() {
        let mut sim = platform(vec![node("n0", GIB, 4.0)]);

        let mut healthy = service(1, false, 1024, 1.0);
        healthy.status = ServiceStatus::Active;
        healthy.backend_status = BackendStatus::Started;

        let mut dead = service(2, false, 1024, 1.0);
        dead.status = ServiceStatus::Active;
        dead.backend_status = BackendStatus::Die;

        let fresh = service(3, false, 1024, 1.0);

        let placed = sim.allocate_elastic(&[healthy, dead, fresh]);
        assert_eq!(placed, vec![2, 3]);
    }

    #[test]
    fn elastic_failures_are_skipped_silently() {
        let mut sim = platform(vec![node("n0", 2048, 4.0)]);
        let services = vec![
            service(1, false, 1500, 1.0),
            service(2, false, 1500, 1.0),
            service(3, false, 100, 1.0),
        ];
        // 1 fits, 2 no longer fits, 3 fits again
        let placed = sim.allocate_elastic(&services);
        assert_eq!(placed, vec![1, 3]);
    }

    #[test]
    fn replayed_services_do_not_consume_capacity() {
        let mut sim = platform(vec![node("n0", 2048, 4.0)]);
        sim.replay(7, "n0");

        assert_eq!(sim.aggregated_free_memory(), 2048);
        assert_eq!(sim.get_service_allocation()[&7], "n0");

        // a replayed elastic service is not placed twice
        let mut replayed = service(7, false, 1024, 1.0);
        replayed.status = ServiceStatus::Runnable;
        assert!(sim.allocate_elastic(&[replayed]).is_empty());
    }

    #[test]
    fn deallocate_elastic_reports_removed_services() {
        let mut sim = platform(vec![node("n0", GIB, 4.0)]);
        let services = vec![service(1, false, 1024, 1.0)];
        sim.allocate_elastic(&services);
        assert_eq!(sim.deallocate_elastic(&services), vec![1]);
        assert!(sim.get_service_allocation().is_empty());
    }

    proptest! {
        /// Essential allocation either places every essential service or
        /// none at all.
        #[test]
        fn essential_all_or_nothing(
            node_memory in proptest::collection::vec(1_000i64..100_000, 1..4),
            service_memory in proptest::collection::vec(1_000i64..60_000, 1..6),
        ) {
            let nodes: Vec<NodeStats> = node_memory
                .iter()
                .enumerate()
                .map(|(i, m)| node(&format!("n{}", i), *m, 16.0))
                .collect();
            let services: Vec<Service> = service_memory
                .iter()
                .enumerate()
                .map(|(i, m)| service(i as i64 + 1, true, *m, 0.5))
                .collect();

            let mut sim = platform(nodes);
            let ok = sim.allocate_essential(&services);
            let allocation = sim.get_service_allocation();
            if ok {
                prop_assert_eq!(allocation.len(), services.len());
            } else {
                prop_assert!(allocation.is_empty());
            }
        }

        /// Respecting `fits` never drives a node's free resources
        /// negative.
        #[test]
        fn placement_never_overcommits(
            node_memory in proptest::collection::vec(1_000i64..100_000, 1..4),
            service_specs in proptest::collection::vec((1_000i64..60_000, 1u32..16), 1..8),
        ) {
            let nodes: Vec<NodeStats> = node_memory
                .iter()
                .enumerate()
                .map(|(i, m)| node(&format!("n{}", i), *m, 8.0))
                .collect();
            let services: Vec<Service> = service_specs
                .iter()
                .enumerate()
                .map(|(i, (m, c))| service(i as i64 + 1, false, *m, f64::from(*c) / 4.0))
                .collect();

            let mut sim = platform(nodes);
            sim.allocate_elastic(&services);
            for node in sim.nodes() {
                prop_assert!(node.free_memory() >= 0);
                prop_assert!(node.free_cores() >= 0.0);
            }
        }
    }
}
