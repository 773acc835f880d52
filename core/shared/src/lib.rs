//! Zoe Shared - Common configuration and utilities for Zoe core components
//!
//! This crate provides the configuration tree loaded by every Zoe process
//! and small helpers shared across the core crates.

pub mod config;

pub use config::{AuthType, BackendSection, ConfigError, NodeSection, SchedulerSection, StateSection, ZoeConfig};

/// Version of the REST API exposed by the external layers
pub const ZOE_API_VERSION: &str = "0.7";

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with an environment filter.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        // Subscriber already installed, that's fine
    }

    tracing::debug!("Zoe {} logging initialized", VERSION);
}
