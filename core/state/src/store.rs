//! The transactional record store
//!
//! All tables live behind a single `RwLock`; every public operation takes
//! the lock exactly once, which gives single-statement transaction
//! semantics with read-after-write within a caller. Cascading operations
//! (execution delete) run under one write guard. When a data directory is
//! configured every mutation is written through to sled, one tree per
//! table, and `open` reloads the full table set.

use crate::application::ApplicationDescription;
use crate::error::{Result, StateError};
use crate::execution::{Execution, ExecutionStatus};
use crate::port::Port;
use crate::service::{BackendStatus, Service, ServiceStatus};
use crate::user::{User, UserRole};
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Identity on whose behalf a store operation runs.
///
/// Non-admin callers only see and touch records they own; the internal
/// system caller used by the scheduler is an admin.
#[derive(Debug, Clone)]
pub struct Caller {
    pub uid: String,
    pub role: UserRole,
}

impl Caller {
    pub fn new(uid: impl Into<String>, role: UserRole) -> Self {
        Self {
            uid: uid.into(),
            role,
        }
    }

    /// The identity used by Zoe's own components.
    pub fn system() -> Self {
        Self::new("zoe-master", UserRole::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    fn owns(&self, owner: &str) -> bool {
        self.is_admin() || self.uid == owner
    }
}

/// Filters for execution listing
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub user_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub name: Option<String>,
}

impl ExecutionFilter {
    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn matches(&self, execution: &Execution) -> bool {
        self.user_id
            .as_ref()
            .map_or(true, |u| &execution.user_id == u)
            && self.status.map_or(true, |s| execution.status == s)
            && self.name.as_ref().map_or(true, |n| &execution.name == n)
    }
}

/// Filters for service listing
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub execution_id: Option<i64>,
    pub status: Option<ServiceStatus>,
    pub backend_status: Option<BackendStatus>,
}

impl ServiceFilter {
    fn matches(&self, service: &Service) -> bool {
        self.execution_id.map_or(true, |e| service.execution_id == e)
            && self.status.map_or(true, |s| service.status == s)
            && self
                .backend_status
                .map_or(true, |s| service.backend_status == s)
    }
}

#[derive(Default)]
struct Tables {
    executions: BTreeMap<i64, Execution>,
    services: BTreeMap<i64, Service>,
    ports: BTreeMap<i64, Port>,
    users: BTreeMap<String, User>,
    next_id: i64,
}

struct Persistence {
    executions: sled::Tree,
    services: sled::Tree,
    ports: sled::Tree,
    users: sled::Tree,
    meta: sled::Tree,
}

impl Persistence {
    fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            executions: db.open_tree("executions")?,
            services: db.open_tree("services")?,
            ports: db.open_tree("ports")?,
            users: db.open_tree("users")?,
            meta: db.open_tree("meta")?,
        })
    }
}

fn put_row<T: Serialize>(tree: &sled::Tree, key: &[u8], row: &T) -> Result<()> {
    let raw = serde_json::to_vec(row)?;
    tree.insert(key, raw)?;
    Ok(())
}

fn load_rows<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for entry in tree.iter() {
        let (_, raw) = entry?;
        rows.push(serde_json::from_slice(&raw)?);
    }
    Ok(rows)
}

/// Durable record store for executions, services, ports and users
pub struct StateStore {
    tables: RwLock<Tables>,
    persist: Option<Persistence>,
    _db: Option<sled::Db>,
}

impl StateStore {
    /// Create a store without persistence. Used by tests and tooling.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            persist: None,
            _db: None,
        }
    }

    /// Open (or create) a persistent store under the given directory.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("zoe-state"))?;
        let persist = Persistence::open(&db)?;

        let mut tables = Tables::default();
        for execution in load_rows::<Execution>(&persist.executions)? {
            tables.executions.insert(execution.id, execution);
        }
        for service in load_rows::<Service>(&persist.services)? {
            tables.services.insert(service.id, service);
        }
        for port in load_rows::<Port>(&persist.ports)? {
            tables.ports.insert(port.id, port);
        }
        for user in load_rows::<User>(&persist.users)? {
            tables.users.insert(user.username.clone(), user);
        }
        if let Some(raw) = persist.meta.get("next_id")? {
            tables.next_id = serde_json::from_slice(&raw)?;
        }

        debug!(
            executions = tables.executions.len(),
            services = tables.services.len(),
            "state store opened"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            persist: Some(persist),
            _db: Some(db),
        })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        if let Some(db) = &self._db {
            db.flush()?;
        }
        Ok(())
    }

    fn allocate_id(&self, tables: &mut Tables) -> Result<i64> {
        tables.next_id += 1;
        let id = tables.next_id;
        if let Some(p) = &self.persist {
            put_row(&p.meta, b"next_id", &id)?;
        }
        Ok(id)
    }

    fn persist_execution(&self, execution: &Execution) -> Result<()> {
        if let Some(p) = &self.persist {
            put_row(&p.executions, &execution.id.to_be_bytes(), execution)?;
        }
        Ok(())
    }

    fn persist_service(&self, service: &Service) -> Result<()> {
        if let Some(p) = &self.persist {
            put_row(&p.services, &service.id.to_be_bytes(), service)?;
        }
        Ok(())
    }

    fn persist_port(&self, port: &Port) -> Result<()> {
        if let Some(p) = &self.persist {
            put_row(&p.ports, &port.id.to_be_bytes(), port)?;
        }
        Ok(())
    }

    // ---- executions ----

    /// Insert an execution and one service row per described service.
    ///
    /// Runs as a single transaction so an execution is never observable
    /// without its services.
    pub fn insert_execution(
        &self,
        name: &str,
        user_id: &str,
        description: ApplicationDescription,
    ) -> Result<i64> {
        let mut tables = self.tables.write();

        let execution_id = self.allocate_id(&mut tables)?;
        let execution = Execution {
            id: execution_id,
            name: name.to_string(),
            user_id: user_id.to_string(),
            status: ExecutionStatus::Submitted,
            description: description.clone(),
            time_submit: Utc::now(),
            time_start: None,
            time_end: None,
        };
        self.persist_execution(&execution)?;
        tables.executions.insert(execution_id, execution);

        for spec in description.services {
            let service_id = self.allocate_id(&mut tables)?;
            let service = Service {
                id: service_id,
                execution_id,
                user_id: user_id.to_string(),
                name: spec.name.clone(),
                status: ServiceStatus::Inactive,
                backend_status: BackendStatus::Undefined,
                backend_host: None,
                container_id: None,
                description: spec,
            };
            self.persist_service(&service)?;
            tables.services.insert(service_id, service);
        }

        debug!(execution_id, name, user_id, "execution inserted");
        Ok(execution_id)
    }

    pub fn execution_by_id(&self, caller: &Caller, id: i64) -> Result<Execution> {
        let tables = self.tables.read();
        let execution = tables
            .executions
            .get(&id)
            .ok_or_else(|| StateError::no_execution(id))?;
        if !caller.owns(&execution.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "execution",
                id: id.to_string(),
            });
        }
        Ok(execution.clone())
    }

    /// List executions; non-admin callers only see their own.
    pub fn executions(&self, caller: &Caller, filter: &ExecutionFilter) -> Vec<Execution> {
        let tables = self.tables.read();
        tables
            .executions
            .values()
            .filter(|e| caller.owns(&e.user_id) && filter.matches(e))
            .cloned()
            .collect()
    }

    /// Transition an execution along the state diagram, stamping
    /// timestamps on the way.
    pub fn set_execution_status(
        &self,
        caller: &Caller,
        id: i64,
        next: ExecutionStatus,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| StateError::no_execution(id))?;
        if !caller.owns(&execution.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "execution",
                id: id.to_string(),
            });
        }
        if !execution.status.can_transition_to(next) {
            warn!(
                execution_id = id,
                from = %execution.status,
                to = %next,
                "rejected illegal status transition"
            );
            return Err(StateError::InvalidTransition {
                from: execution.status,
                to: next,
            });
        }

        execution.status = next;
        match next {
            ExecutionStatus::Running if execution.time_start.is_none() => {
                execution.time_start = Some(Utc::now());
            }
            ExecutionStatus::Terminated | ExecutionStatus::Error => {
                execution.time_end = Some(Utc::now());
            }
            _ => {}
        }
        let row = execution.clone();
        self.persist_execution(&row)?;
        debug!(execution_id = id, status = %next, "execution status updated");
        Ok(())
    }

    /// Delete an inactive execution together with its services and ports.
    pub fn delete_execution(&self, caller: &Caller, id: i64) -> Result<()> {
        let mut tables = self.tables.write();
        let execution = tables
            .executions
            .get(&id)
            .ok_or_else(|| StateError::no_execution(id))?;
        if !caller.owns(&execution.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "execution",
                id: id.to_string(),
            });
        }
        if execution.is_active() {
            return Err(StateError::InvalidState {
                message: format!("execution {} is still active", id),
            });
        }

        let service_ids: Vec<i64> = tables
            .services
            .values()
            .filter(|s| s.execution_id == id)
            .map(|s| s.id)
            .collect();
        let port_ids: Vec<i64> = tables
            .ports
            .values()
            .filter(|p| service_ids.contains(&p.service_id))
            .map(|p| p.id)
            .collect();

        if let Some(p) = &self.persist {
            let mut service_batch = sled::Batch::default();
            for sid in &service_ids {
                service_batch.remove(sid.to_be_bytes().to_vec());
            }
            let mut port_batch = sled::Batch::default();
            for pid in &port_ids {
                port_batch.remove(pid.to_be_bytes().to_vec());
            }
            p.executions.remove(id.to_be_bytes())?;
            p.services.apply_batch(service_batch)?;
            p.ports.apply_batch(port_batch)?;
        }

        for pid in port_ids {
            tables.ports.remove(&pid);
        }
        for sid in service_ids {
            tables.services.remove(&sid);
        }
        tables.executions.remove(&id);
        debug!(execution_id = id, "execution deleted");
        Ok(())
    }

    // ---- services ----

    pub fn service_by_id(&self, caller: &Caller, id: i64) -> Result<Service> {
        let tables = self.tables.read();
        let service = tables
            .services
            .get(&id)
            .ok_or_else(|| StateError::no_service(id))?;
        if !caller.owns(&service.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "service",
                id: id.to_string(),
            });
        }
        Ok(service.clone())
    }

    pub fn services(&self, caller: &Caller, filter: &ServiceFilter) -> Vec<Service> {
        let tables = self.tables.read();
        tables
            .services
            .values()
            .filter(|s| caller.owns(&s.user_id) && filter.matches(s))
            .cloned()
            .collect()
    }

    /// Services of one execution, in startup order.
    pub fn services_of_execution(&self, caller: &Caller, execution_id: i64) -> Result<Vec<Service>> {
        let tables = self.tables.read();
        let execution = tables
            .executions
            .get(&execution_id)
            .ok_or_else(|| StateError::no_execution(execution_id))?;
        if !caller.owns(&execution.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "execution",
                id: execution_id.to_string(),
            });
        }
        let mut services: Vec<Service> = tables
            .services
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        services.sort_by_key(|s| (s.startup_order(), s.id));
        Ok(services)
    }

    fn with_service_mut<F>(&self, caller: &Caller, id: i64, update: F) -> Result<()>
    where
        F: FnOnce(&mut Service),
    {
        let mut tables = self.tables.write();
        let service = tables
            .services
            .get_mut(&id)
            .ok_or_else(|| StateError::no_service(id))?;
        if !caller.owns(&service.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "service",
                id: id.to_string(),
            });
        }
        update(service);
        let row = service.clone();
        self.persist_service(&row)?;
        Ok(())
    }

    pub fn set_service_status(&self, caller: &Caller, id: i64, status: ServiceStatus) -> Result<()> {
        self.with_service_mut(caller, id, |s| s.status = status)
    }

    pub fn set_service_backend_status(
        &self,
        caller: &Caller,
        id: i64,
        backend_status: BackendStatus,
    ) -> Result<()> {
        self.with_service_mut(caller, id, |s| s.backend_status = backend_status)
    }

    /// Record the (node, container) pair of a placed service.
    ///
    /// Two services may never share a container id; a duplicate is an
    /// accounting bug and is rejected.
    pub fn assign_service(
        &self,
        caller: &Caller,
        id: i64,
        node: &str,
        container_id: &str,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(holder) = tables
            .services
            .values()
            .find(|s| s.id != id && s.container_id.as_deref() == Some(container_id))
        {
            warn!(
                service_id = id,
                holder = holder.id,
                container_id,
                "container id already assigned to another service"
            );
            return Err(StateError::InvalidState {
                message: format!("container {} already assigned", container_id),
            });
        }
        let service = tables
            .services
            .get_mut(&id)
            .ok_or_else(|| StateError::no_service(id))?;
        if !caller.owns(&service.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "service",
                id: id.to_string(),
            });
        }
        service.backend_host = Some(node.to_string());
        service.container_id = Some(container_id.to_string());
        let row = service.clone();
        self.persist_service(&row)?;
        Ok(())
    }

    pub fn clear_service_assignment(&self, caller: &Caller, id: i64) -> Result<()> {
        self.with_service_mut(caller, id, |s| {
            s.backend_host = None;
            s.container_id = None;
        })
    }

    // ---- ports ----

    pub fn insert_port(
        &self,
        caller: &Caller,
        service_id: i64,
        internal_name: &str,
        external_ip: Option<String>,
        external_port: Option<u16>,
    ) -> Result<i64> {
        let mut tables = self.tables.write();
        let owner = tables
            .services
            .get(&service_id)
            .ok_or_else(|| StateError::no_service(service_id))?
            .user_id
            .clone();
        if !caller.owns(&owner) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "service",
                id: service_id.to_string(),
            });
        }
        let id = self.allocate_id(&mut tables)?;
        let port = Port {
            id,
            service_id,
            internal_name: internal_name.to_string(),
            external_ip,
            external_port,
        };
        self.persist_port(&port)?;
        tables.ports.insert(id, port);
        Ok(id)
    }

    pub fn ports_of_service(&self, caller: &Caller, service_id: i64) -> Result<Vec<Port>> {
        let tables = self.tables.read();
        let service = tables
            .services
            .get(&service_id)
            .ok_or_else(|| StateError::no_service(service_id))?;
        if !caller.owns(&service.user_id) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "service",
                id: service_id.to_string(),
            });
        }
        Ok(tables
            .ports
            .values()
            .filter(|p| p.service_id == service_id)
            .cloned()
            .collect())
    }

    /// Look up one port record by its internal `<number>/<proto>` name.
    pub fn port_by_internal_name(
        &self,
        caller: &Caller,
        service_id: i64,
        internal_name: &str,
    ) -> Result<Option<Port>> {
        Ok(self
            .ports_of_service(caller, service_id)?
            .into_iter()
            .find(|p| p.internal_name == internal_name))
    }

    pub fn delete_ports_of_service(&self, caller: &Caller, service_id: i64) -> Result<()> {
        let mut tables = self.tables.write();
        let owner = tables
            .services
            .get(&service_id)
            .ok_or_else(|| StateError::no_service(service_id))?
            .user_id
            .clone();
        if !caller.owns(&owner) {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "service",
                id: service_id.to_string(),
            });
        }
        let port_ids: Vec<i64> = tables
            .ports
            .values()
            .filter(|p| p.service_id == service_id)
            .map(|p| p.id)
            .collect();
        if let Some(p) = &self.persist {
            let mut batch = sled::Batch::default();
            for pid in &port_ids {
                batch.remove(pid.to_be_bytes().to_vec());
            }
            p.ports.apply_batch(batch)?;
        }
        for pid in port_ids {
            tables.ports.remove(&pid);
        }
        Ok(())
    }

    // ---- users ----

    /// Create or update a user. Admin only.
    pub fn upsert_user(&self, caller: &Caller, username: &str, role: UserRole) -> Result<()> {
        if !caller.is_admin() {
            return Err(StateError::Forbidden {
                uid: caller.uid.clone(),
                kind: "user",
                id: username.to_string(),
            });
        }
        let mut tables = self.tables.write();
        let user = User {
            username: username.to_string(),
            role,
        };
        if let Some(p) = &self.persist {
            put_row(&p.users, username.as_bytes(), &user)?;
        }
        tables.users.insert(username.to_string(), user);
        Ok(())
    }

    pub fn user_by_name(&self, username: &str) -> Result<User> {
        let tables = self.tables.read();
        tables
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| StateError::no_user(username))
    }

    pub fn users(&self) -> Vec<User> {
        self.tables.read().users.values().cloned().collect()
    }
}
