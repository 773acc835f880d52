//! End-to-end scheduling scenarios against the simulated backend

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use zoe_backend::{ClusterStatsProvider, ContainerBackend, SimulatedBackend, SimulatedNodeSpec};
use zoe_scheduler::{spawn, BackendEvent, EventIngest, SchedulerHandle};
use zoe_shared::ZoeConfig;
use zoe_state::application::{
    ApplicationDescription, ResourceReservation, ServiceDescription,
};
use zoe_state::{Caller, ExecutionStatus, Service, ServiceStatus, StateStore};

const GIB: i64 = 1024 * 1024 * 1024;

struct Harness {
    store: Arc<StateStore>,
    backend: Arc<SimulatedBackend>,
    handle: SchedulerHandle,
    config: ZoeConfig,
    caller: Caller,
}

fn harness(nodes: Vec<SimulatedNodeSpec>) -> Harness {
    let store = Arc::new(StateStore::in_memory());
    let backend = Arc::new(SimulatedBackend::new(nodes));
    let provider = Arc::new(ClusterStatsProvider::new(
        backend.clone() as Arc<dyn ContainerBackend>
    ));
    let mut config = ZoeConfig::default();
    config.observer_shared_secret = "s3cret".to_string();
    let (handle, _task) = spawn(
        store.clone(),
        backend.clone() as Arc<dyn ContainerBackend>,
        provider,
        config.clone(),
    );
    Harness {
        store,
        backend,
        handle,
        config,
        caller: Caller::system(),
    }
}

fn service(
    name: &str,
    essential: bool,
    monitor: bool,
    memory: i64,
    cores: f64,
    labels: &[&str],
) -> ServiceDescription {
    ServiceDescription {
        name: name.to_string(),
        image: "img:1".to_string(),
        monitor,
        essential,
        resources: ResourceReservation::new(memory, cores),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        ports: Vec::new(),
        environment: Vec::new(),
        volumes: Vec::new(),
        command: None,
        startup_order: 0,
    }
}

fn app(name: &str, services: Vec<ServiceDescription>) -> ApplicationDescription {
    ApplicationDescription {
        name: name.to_string(),
        version: 1,
        will_end: false,
        services,
    }
}

fn submit(harness: &Harness, name: &str, description: ApplicationDescription) -> i64 {
    let id = harness
        .store
        .insert_execution(name, "alice", description)
        .unwrap();
    harness.handle.submit(id).unwrap();
    id
}

async fn wait_for_status(harness: &Harness, execution_id: i64, expected: ExecutionStatus) {
    for _ in 0..200 {
        let status = harness
            .store
            .execution_by_id(&harness.caller, execution_id)
            .unwrap()
            .status;
        if status == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = harness
        .store
        .execution_by_id(&harness.caller, execution_id)
        .unwrap()
        .status;
    panic!("execution {execution_id} stuck in {status}, expected {expected}");
}

fn services_of(harness: &Harness, execution_id: i64) -> Vec<Service> {
    harness
        .store
        .services_of_execution(&harness.caller, execution_id)
        .unwrap()
}

#[tokio::test]
async fn single_node_fit() {
    let harness = harness(vec![SimulatedNodeSpec::new("node0", 4 * GIB, 4.0)
        .with_labels(["gpu"])
        .with_images(["img:1"])]);

    let id = submit(
        &harness,
        "e1",
        app("a", vec![service("master", true, true, GIB, 1.0, &["gpu"])]),
    );
    wait_for_status(&harness, id, ExecutionStatus::Running).await;

    let services = services_of(&harness, id);
    assert_eq!(services[0].status, ServiceStatus::Active);
    assert_eq!(services[0].backend_host.as_deref(), Some("node0"));
    assert!(services[0].container_id.is_some());
    assert_eq!(harness.backend.container_count(), 1);
}

#[tokio::test]
async fn strict_memory_rule_rejects_exact_fit() {
    // free memory equals the request: must not fit
    let harness =
        harness(vec![SimulatedNodeSpec::new("node0", 1024, 4.0).with_images(["img:1"])]);

    let id = submit(
        &harness,
        "e1",
        app("a", vec![service("master", true, true, 1024, 1.0, &[])]),
    );
    wait_for_status(&harness, id, ExecutionStatus::Scheduled).await;

    harness.handle.tick().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let execution = harness.store.execution_by_id(&harness.caller, id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Scheduled);
    assert_eq!(harness.backend.container_count(), 0);

    let stats = harness.handle.statistics().await.unwrap();
    assert_eq!(stats.queue_length, 1);
}

#[tokio::test]
async fn least_loaded_node_wins() {
    let harness = harness(vec![
        SimulatedNodeSpec::new("busy", 8 * GIB, 8.0)
            .with_images(["img:1"])
            .with_preexisting_containers(5),
        SimulatedNodeSpec::new("quiet", 8 * GIB, 8.0)
            .with_images(["img:1"])
            .with_preexisting_containers(3),
    ]);

    let id = submit(
        &harness,
        "e1",
        app("a", vec![service("master", true, true, GIB, 1.0, &[])]),
    );
    wait_for_status(&harness, id, ExecutionStatus::Running).await;

    let services = services_of(&harness, id);
    assert_eq!(services[0].backend_host.as_deref(), Some("quiet"));
}

#[tokio::test]
async fn monitor_death_terminates_execution() {
    let harness = harness(vec![
        SimulatedNodeSpec::new("node0", 8 * GIB, 8.0).with_images(["img:1"])
    ]);

    let id = submit(
        &harness,
        "e1",
        app(
            "a",
            vec![
                service("master", true, true, GIB, 1.0, &[]),
                service("worker", false, false, GIB, 1.0, &[]),
            ],
        ),
    );
    wait_for_status(&harness, id, ExecutionStatus::Running).await;
    assert_eq!(harness.backend.container_count(), 2);

    let monitor_id = services_of(&harness, id)
        .iter()
        .find(|s| s.monitor())
        .unwrap()
        .id;

    // deliver the death through the observer event path
    let ingest = EventIngest::new(&harness.config, harness.handle.clone());
    let forwarded = ingest
        .deliver("s3cret", &BackendEvent::die("zoe", monitor_id))
        .unwrap();
    assert!(forwarded);

    wait_for_status(&harness, id, ExecutionStatus::Terminated).await;

    // a terminated execution has no active services
    for service in services_of(&harness, id) {
        assert_eq!(service.status, ServiceStatus::Inactive);
        assert!(service.container_id.is_none());
    }
    assert_eq!(harness.backend.container_count(), 0);
}

#[tokio::test]
async fn queued_execution_runs_after_capacity_release() {
    let harness = harness(vec![
        SimulatedNodeSpec::new("node0", 2 * GIB, 8.0).with_images(["img:1"])
    ]);

    let a = submit(
        &harness,
        "a",
        app("a", vec![service("master", true, true, GIB, 1.0, &[])]),
    );
    wait_for_status(&harness, a, ExecutionStatus::Running).await;

    // the cluster is full for a second 1 GiB request (strict memory rule)
    let b = submit(
        &harness,
        "b",
        app("b", vec![service("master", true, true, GIB, 1.0, &[])]),
    );
    wait_for_status(&harness, b, ExecutionStatus::Scheduled).await;
    harness.handle.tick().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.store.execution_by_id(&harness.caller, b).unwrap().status,
        ExecutionStatus::Scheduled
    );

    harness.handle.terminate(a).await.unwrap();
    wait_for_status(&harness, a, ExecutionStatus::Terminated).await;
    wait_for_status(&harness, b, ExecutionStatus::Running).await;
}

#[tokio::test]
async fn create_failure_keeps_execution_starting_until_retry() {
    let harness = harness(vec![
        SimulatedNodeSpec::new("node0", 8 * GIB, 8.0).with_images(["img:1"])
    ]);
    harness.backend.set_fail_create(true);

    let id = submit(
        &harness,
        "e1",
        app("a", vec![service("master", true, true, GIB, 1.0, &[])]),
    );
    wait_for_status(&harness, id, ExecutionStatus::Starting).await;

    let services = services_of(&harness, id);
    assert_eq!(services[0].status, ServiceStatus::Inactive);
    assert_eq!(harness.backend.container_count(), 0);

    harness.backend.set_fail_create(false);
    harness.handle.tick().unwrap();
    wait_for_status(&harness, id, ExecutionStatus::Running).await;
    assert_eq!(harness.backend.container_count(), 1);
}

#[tokio::test]
async fn elastic_services_are_opportunistic() {
    let harness = harness(vec![
        SimulatedNodeSpec::new("node0", 3 * GIB, 8.0).with_images(["img:1"])
    ]);

    // master fits; only one of the two elastic workers does
    let id = submit(
        &harness,
        "e1",
        app(
            "a",
            vec![
                service("master", true, true, GIB, 1.0, &[]),
                service("worker1", false, false, GIB, 1.0, &[]),
                service("worker2", false, false, GIB, 1.0, &[]),
            ],
        ),
    );
    wait_for_status(&harness, id, ExecutionStatus::Running).await;

    let active: BTreeSet<String> = services_of(&harness, id)
        .iter()
        .filter(|s| s.status == ServiceStatus::Active)
        .map(|s| s.name.clone())
        .collect();
    assert!(active.contains("master"));
    // 3 GiB total: master takes 1, the first worker takes the second,
    // the third would need memory the strict rule refuses
    assert_eq!(harness.backend.container_count(), 2);
}

#[tokio::test]
async fn deterministic_placement_across_runs() {
    let nodes = || {
        vec![
            SimulatedNodeSpec::new("n0", 8 * GIB, 8.0).with_images(["img:1"]),
            SimulatedNodeSpec::new("n1", 8 * GIB, 8.0).with_images(["img:1"]),
        ]
    };
    let description = || {
        app(
            "a",
            vec![
                service("s1", true, true, GIB, 1.0, &[]),
                service("s2", true, false, GIB, 1.0, &[]),
                service("s3", false, false, GIB, 1.0, &[]),
            ],
        )
    };

    let mut placements = Vec::new();
    for _ in 0..2 {
        let harness = harness(nodes());
        let id = submit(&harness, "e", description());
        wait_for_status(&harness, id, ExecutionStatus::Running).await;
        let placement: Vec<(String, Option<String>)> = services_of(&harness, id)
            .iter()
            .map(|s| (s.name.clone(), s.backend_host.clone()))
            .collect();
        placements.push(placement);
    }
    assert_eq!(placements[0], placements[1]);
}
