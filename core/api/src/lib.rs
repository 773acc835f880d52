//! Zoe API - In-process facade consumed by the REST layer
//!
//! The facade validates ZApps, enforces quotas and ownership, and
//! translates client requests into state-store operations and scheduler
//! commands. It never speaks HTTP itself: the REST layer calls these
//! methods and maps [`ApiError`] kinds to status codes.

pub mod error;

pub use error::{ApiError, Result};

use serde::Serialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use zoe_scheduler::{SchedulerHandle, SchedulerStats};
use zoe_shared::ZoeConfig;
use zoe_state::{
    ApplicationDescription, Caller, Execution, ExecutionFilter, Port, Service, ServiceFilter,
    StateStore, User, UserRole,
};

/// Outcome of a successful execution submission
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub execution_id: i64,

    /// False when the execution was persisted but the scheduler could
    /// not be signalled; a later reconciliation will pick it up.
    pub scheduler_notified: bool,
}

/// The API facade
pub struct ApiEndpoint {
    store: Arc<StateStore>,
    scheduler: SchedulerHandle,
    config: ZoeConfig,
}

impl ApiEndpoint {
    pub fn new(store: Arc<StateStore>, scheduler: SchedulerHandle, config: ZoeConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    // ---- executions ----

    /// Lookup an execution by its id.
    pub fn execution_by_id(&self, caller: &Caller, execution_id: i64) -> Result<Execution> {
        Ok(self.store.execution_by_id(caller, execution_id)?)
    }

    /// List executions visible to the caller, optionally filtered.
    pub fn execution_list(&self, caller: &Caller, filter: &ExecutionFilter) -> Vec<Execution> {
        self.store.executions(caller, filter)
    }

    /// Validate a ZApp description against the supported schema.
    pub fn zapp_validate(&self, description: &ApplicationDescription) -> Result<()> {
        description.validate()?;
        Ok(())
    }

    /// Validate, admit under quota, persist and submit an execution.
    ///
    /// When the scheduler cannot be reached the execution stays
    /// persisted in submitted state and the outcome says so; it will be
    /// resubmitted by the master's reconciliation at startup.
    pub fn execution_start(
        &self,
        caller: &Caller,
        name: &str,
        description: ApplicationDescription,
    ) -> Result<StartOutcome> {
        self.zapp_validate(&description)?;

        if caller.role == UserRole::Guest {
            let owned = self.store.executions(
                caller,
                &ExecutionFilter {
                    user_id: Some(caller.uid.clone()),
                    ..ExecutionFilter::default()
                },
            );
            let counted = owned
                .iter()
                .filter(|e| e.status.counts_toward_quota())
                .count();
            if counted >= self.config.guest_quota_max_executions {
                return Err(ApiError::invalid_state(
                    "guest users cannot run more than one execution at a time, quota exceeded",
                ));
            }
        }

        let execution_id = self
            .store
            .insert_execution(name, &caller.uid, description)?;
        info!(execution_id, user = %caller.uid, "execution submitted");

        match self.scheduler.submit(execution_id) {
            Ok(()) => Ok(StartOutcome {
                execution_id,
                scheduler_notified: true,
            }),
            Err(err) if err.is_unreachable() => {
                warn!(
                    execution_id,
                    "scheduler unreachable, execution persisted for later pickup"
                );
                Ok(StartOutcome {
                    execution_id,
                    scheduler_notified: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Terminate an active execution.
    pub async fn execution_terminate(&self, caller: &Caller, execution_id: i64) -> Result<()> {
        let execution = self.store.execution_by_id(caller, execution_id)?;
        if !execution.is_active() {
            return Err(ApiError::invalid_state("execution is not running"));
        }
        self.scheduler.terminate(execution_id).await?;
        Ok(())
    }

    /// Delete an inactive execution and everything attached to it.
    /// Admin only.
    pub fn execution_delete(&self, caller: &Caller, execution_id: i64) -> Result<()> {
        if !caller.is_admin() {
            return Err(ApiError::forbidden("only admins may delete executions"));
        }
        let execution = self.store.execution_by_id(caller, execution_id)?;
        if execution.is_active() {
            return Err(ApiError::invalid_state("cannot delete an active execution"));
        }
        self.store.delete_execution(caller, execution_id)?;
        Ok(())
    }

    // ---- services ----

    /// Lookup a service by its id.
    pub fn service_by_id(&self, caller: &Caller, service_id: i64) -> Result<Service> {
        Ok(self.store.service_by_id(caller, service_id)?)
    }

    /// List services visible to the caller, optionally filtered.
    pub fn service_list(&self, caller: &Caller, filter: &ServiceFilter) -> Vec<Service> {
        self.store.services(caller, filter)
    }

    /// Open the log file of a service as a lazy byte stream.
    ///
    /// Logs are collected under
    /// `<base>/<deployment>/<execution-id>/<service-name>.txt` and read
    /// directly by the REST workers, bypassing the scheduler.
    pub async fn service_logs(
        &self,
        caller: &Caller,
        service_id: i64,
    ) -> Result<ReaderStream<tokio::fs::File>> {
        let service = self.service_by_id(caller, service_id)?;
        let path = self
            .config
            .service_logs_base_path
            .join(&self.config.deployment_name)
            .join(service.execution_id.to_string())
            .join(format!("{}.txt", service.name));
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| ApiError::not_found("service log"))?;
        Ok(ReaderStream::new(file))
    }

    /// Services of an execution plus the public endpoints reachable
    /// right now.
    ///
    /// For every declared port with an external address, the endpoint is
    /// the declared url template with `{ip_port}` substituted by
    /// `<external_ip>:<external_port>`.
    pub fn execution_endpoints(
        &self,
        caller: &Caller,
        execution: &Execution,
    ) -> Result<(Vec<Service>, Vec<(String, String)>)> {
        let services = self.store.services_of_execution(caller, execution.id)?;
        let mut endpoints = Vec::new();
        for service in &services {
            for declared in &service.description.ports {
                let template = match &declared.url_template {
                    Some(template) => template,
                    None => continue,
                };
                let record: Option<Port> = self.store.port_by_internal_name(
                    caller,
                    service.id,
                    &declared.internal_name(),
                )?;
                if let Some(address) = record.as_ref().and_then(|p| p.external_address()) {
                    endpoints.push((declared.name.clone(), template.replace("{ip_port}", &address)));
                }
            }
        }
        Ok((services, endpoints))
    }

    // ---- statistics ----

    /// Scheduler statistics, with per-node service stats keyed by
    /// integer service id.
    pub async fn statistics_scheduler(&self) -> Result<SchedulerStats> {
        Ok(self.scheduler.statistics().await?)
    }

    // ---- users ----

    /// Fetch a user record; non-admins may only fetch themselves.
    pub fn user_by_name(&self, caller: &Caller, username: &str) -> Result<User> {
        if !caller.is_admin() && caller.uid != username {
            return Err(ApiError::Auth);
        }
        Ok(self.store.user_by_name(username)?)
    }

    /// List users; non-admins only see themselves.
    pub fn user_list(&self, caller: &Caller) -> Vec<User> {
        if caller.is_admin() {
            self.store.users()
        } else {
            self.store
                .user_by_name(&caller.uid)
                .map(|u| vec![u])
                .unwrap_or_default()
        }
    }

    /// Create or update a user. Admin only.
    pub fn user_update(&self, caller: &Caller, username: &str, role: UserRole) -> Result<()> {
        if !caller.is_admin() {
            return Err(ApiError::forbidden("only admins may update users"));
        }
        self.store.upsert_user(caller, username, role)?;
        Ok(())
    }
}
