//! Zoe master daemon
//!
//! Wires the state store, the container backend, the stats provider and
//! the scheduler actor together, resubmits executions left behind by an
//! earlier run, and drives periodic scheduling passes until shutdown.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use zoe_backend::{ClusterStatsProvider, ContainerBackend, SimulatedBackend, SimulatedNodeSpec};
use zoe_shared::ZoeConfig;
use zoe_state::{Caller, ExecutionFilter, ExecutionStatus, StateStore};

#[derive(Parser, Debug)]
#[command(name = "zoe-master", about = "Zoe execution master", version)]
struct Args {
    /// Path to the configuration file
    #[arg(long, env = "ZOE_CONFIG")]
    config: Option<PathBuf>,

    /// Tracing filter, e.g. "info" or "zoe=debug"
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    zoe_shared::init_tracing(&args.log_filter);

    let config = match &args.config {
        Some(path) => ZoeConfig::from_file(path).context("loading configuration")?,
        None => ZoeConfig::default(),
    };
    info!(deployment = %config.deployment_name, "starting zoe master");

    let store = match &config.state.data_dir {
        Some(dir) => Arc::new(StateStore::open(dir).context("opening state store")?),
        None => {
            warn!("no data_dir configured, state will not survive restarts");
            Arc::new(StateStore::in_memory())
        }
    };

    let backend = Arc::new(build_backend(&config));
    let provider = Arc::new(ClusterStatsProvider::new(
        backend.clone() as Arc<dyn ContainerBackend>
    ));
    let (scheduler, scheduler_task) = zoe_scheduler::spawn(
        store.clone(),
        backend as Arc<dyn ContainerBackend>,
        provider,
        config.clone(),
    );

    // resubmit executions a previous run accepted but never scheduled
    let system = Caller::system();
    for execution in store.executions(
        &system,
        &ExecutionFilter::with_status(ExecutionStatus::Submitted),
    ) {
        info!(execution_id = execution.id, "resubmitting execution found at boot");
        if scheduler.submit(execution.id).is_err() {
            break;
        }
    }

    let ticker_handle = scheduler.clone();
    let interval = config.scheduler.tick_interval();
    let ticker = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            if ticker_handle.tick().is_err() {
                break;
            }
        }
    });

    info!("zoe master is up");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down");
    ticker.abort();
    scheduler.shutdown();
    let _ = scheduler_task.await;
    if let Err(err) = store.flush() {
        warn!(%err, "state flush on shutdown failed");
    }
    Ok(())
}

fn build_backend(config: &ZoeConfig) -> SimulatedBackend {
    if config.backend.nodes.is_empty() {
        warn!("no backend nodes configured, the scheduler has nothing to place on");
    }
    let nodes = config
        .backend
        .nodes
        .iter()
        .map(|section| {
            SimulatedNodeSpec::new(&section.name, section.memory_total, section.cores_total)
                .with_labels(section.labels.iter().cloned())
                .with_images(section.images.iter().cloned())
        })
        .collect();
    SimulatedBackend::new(nodes)
}
