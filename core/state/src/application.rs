//! ZApp application descriptions
//!
//! A ZApp is the declarative description of a multi-container analytics
//! application. It is embedded verbatim in the execution record at submit
//! time; the per-service parts drive placement and container creation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Description validation failure, with a message for the submitting user
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

fn invalid(message: impl Into<String>) -> ValidationError {
    ValidationError(message.into())
}

/// A declarative multi-service application description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationDescription {
    pub name: String,

    /// Description format version
    #[serde(default)]
    pub version: u32,

    /// Whether the application terminates by itself
    #[serde(default)]
    pub will_end: bool,

    pub services: Vec<ServiceDescription>,
}

impl ApplicationDescription {
    /// Validate the description against the supported schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(invalid("application name cannot be empty"));
        }
        if self.services.is_empty() {
            return Err(invalid("application has no services"));
        }

        let mut names = BTreeSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(invalid(format!("duplicate service name '{}'", service.name)));
            }
            service.validate()?;
        }

        if !self.services.iter().any(|s| s.monitor) {
            return Err(invalid("at least one service must be a monitor"));
        }
        if !self.services.iter().any(|s| s.essential) {
            return Err(invalid("at least one service must be essential"));
        }
        Ok(())
    }
}

/// One service of a ZApp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDescription {
    pub name: String,

    /// Docker image reference
    pub image: String,

    /// The death of a monitor service ends the whole execution
    #[serde(default)]
    pub monitor: bool,

    /// Essential services must all be placed before the execution can start
    #[serde(default)]
    pub essential: bool,

    pub resources: ResourceReservation,

    /// Labels that must all be present on the hosting node
    #[serde(default)]
    pub labels: BTreeSet<String>,

    #[serde(default)]
    pub ports: Vec<PortDescription>,

    #[serde(default)]
    pub environment: Vec<(String, String)>,

    #[serde(default)]
    pub volumes: Vec<VolumeDescription>,

    #[serde(default)]
    pub command: Option<String>,

    /// Services are created on the backend in ascending startup order
    #[serde(default)]
    pub startup_order: u32,
}

impl ServiceDescription {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(invalid("service name cannot be empty"));
        }
        if self.image.is_empty() {
            return Err(invalid(format!("service '{}' has no image", self.name)));
        }
        if self.resources.memory.min <= 0 {
            return Err(invalid(format!(
                "service '{}' must reserve a positive amount of memory",
                self.name
            )));
        }
        if self.resources.cores.min < 0.0 {
            return Err(invalid(format!(
                "service '{}' has a negative core reservation",
                self.name
            )));
        }
        for port in &self.ports {
            port.validate(&self.name)?;
        }
        Ok(())
    }
}

/// Memory and core reservation of a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceReservation {
    pub memory: MemoryRange,
    pub cores: CoreRange,
}

impl ResourceReservation {
    /// Convenience constructor for the common min-only case.
    pub fn new(memory_min: i64, cores_min: f64) -> Self {
        Self {
            memory: MemoryRange {
                min: memory_min,
                max: None,
            },
            cores: CoreRange {
                min: cores_min,
                max: None,
            },
        }
    }
}

/// Memory reservation in bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRange {
    pub min: i64,
    #[serde(default)]
    pub max: Option<i64>,
}

/// Core reservation, fractional cores allowed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreRange {
    pub min: f64,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Transport protocol of a declared port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Tcp => write!(f, "tcp"),
            PortProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// A port declared by a service description
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortDescription {
    pub name: String,
    pub port_number: u16,
    pub protocol: PortProtocol,

    /// URL template with an `{ip_port}` placeholder, used to build the
    /// user-visible endpoint once the backend assigns an external address
    #[serde(default)]
    pub url_template: Option<String>,
}

impl PortDescription {
    /// Internal name of the port record: `<number>/<protocol>`.
    pub fn internal_name(&self) -> String {
        format!("{}/{}", self.port_number, self.protocol)
    }

    fn validate(&self, service: &str) -> Result<(), ValidationError> {
        if self.port_number == 0 {
            return Err(invalid(format!(
                "service '{}' declares port 0",
                service
            )));
        }
        if let Some(template) = &self.url_template {
            if !template.contains("{ip_port}") {
                return Err(invalid(format!(
                    "url template for port '{}' of service '{}' has no {{ip_port}} placeholder",
                    self.name, service
                )));
            }
        }
        Ok(())
    }
}

/// A volume bind-mounted into a service container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeDescription {
    pub name: String,
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}
