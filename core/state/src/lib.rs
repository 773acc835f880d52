//! Zoe State - Execution state model and record store
//!
//! This crate holds the durable data model of a Zoe deployment:
//! - ZApp application descriptions as submitted by users
//! - Executions and their lifecycle state machine
//! - Services, their placement attributes and backend status
//! - Port records materialized after container creation
//! - Users and their roles
//!
//! plus the transactional [`StateStore`] that owns all of them.

pub mod application;
pub mod error;
pub mod execution;
pub mod port;
pub mod service;
pub mod store;
pub mod user;

pub use application::{
    ApplicationDescription, CoreRange, MemoryRange, PortDescription, PortProtocol,
    ResourceReservation, ServiceDescription, ValidationError, VolumeDescription,
};
pub use error::{Result, StateError};
pub use execution::{Execution, ExecutionStatus};
pub use port::Port;
pub use service::{BackendStatus, Service, ServiceStatus};
pub use store::{Caller, ExecutionFilter, ServiceFilter, StateStore};
pub use user::{User, UserRole};
