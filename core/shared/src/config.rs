//! Configuration management for Zoe components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading the configuration file
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Supported authentication backends for the external API layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Text,
    Ldap,
    #[serde(rename = "ldapsasl")]
    LdapSasl,
}

/// Global configuration for a Zoe deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoeConfig {
    /// Namespace prefix identifying this deployment
    pub deployment_name: String,

    /// Prefix applied to every container name created by this deployment
    pub container_name_prefix: String,

    /// Base directory where per-service log files are collected
    pub service_logs_base_path: PathBuf,

    /// Authentication backend used by the API layer
    pub auth_type: AuthType,

    /// URL of the master process
    pub master_address: String,

    /// Shared secret presented by the observer on the event channel
    pub observer_shared_secret: String,

    /// Maximum number of concurrent executions for guest users
    pub guest_quota_max_executions: usize,

    pub scheduler: SchedulerSection,
    pub state: StateSection,
    pub backend: BackendSection,
}

impl Default for ZoeConfig {
    fn default() -> Self {
        Self {
            deployment_name: "zoe".to_string(),
            container_name_prefix: "zoe".to_string(),
            service_logs_base_path: PathBuf::from("/var/lib/zoe/logs"),
            auth_type: AuthType::Text,
            master_address: "http://127.0.0.1:4850".to_string(),
            observer_shared_secret: String::new(),
            guest_quota_max_executions: 1,
            scheduler: SchedulerSection::default(),
            state: StateSection::default(),
            backend: BackendSection::default(),
        }
    }
}

impl ZoeConfig {
    /// Load the configuration from a toml file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Scheduler tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Seconds between periodic scheduling passes
    pub tick_interval_seconds: u64,

    /// Upper bound on any single backend driver call
    pub backend_timeout_seconds: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 30,
            backend_timeout_seconds: 60,
        }
    }
}

impl SchedulerSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_seconds)
    }
}

/// State store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    /// Directory holding the persistent state database.
    /// When unset the store runs in memory only.
    pub data_dir: Option<PathBuf>,
}

/// Description of the cluster served by the development backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub nodes: Vec<NodeSection>,
}

/// One execution host in the development backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub name: String,

    /// Total memory in bytes
    pub memory_total: i64,

    /// Total cores, fractional cores allowed
    pub cores_total: f64,

    pub labels: Vec<String>,

    /// Image references already present on the node
    pub images: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: "node0".to_string(),
            memory_total: 16 * 1024 * 1024 * 1024,
            cores_total: 8.0,
            labels: Vec::new(),
            images: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = ZoeConfig::default();
        assert_eq!(cfg.guest_quota_max_executions, 1);
        assert_eq!(cfg.auth_type, AuthType::Text);
        assert_eq!(cfg.scheduler.tick_interval(), Duration::from_secs(30));
        assert!(cfg.state.data_dir.is_none());
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
deployment_name = "prod"
guest_quota_max_executions = 3

[scheduler]
tick_interval_seconds = 5
"#
        )
        .unwrap();

        let cfg = ZoeConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.deployment_name, "prod");
        assert_eq!(cfg.guest_quota_max_executions, 3);
        assert_eq!(cfg.scheduler.tick_interval_seconds, 5);
        // untouched sections keep their defaults
        assert_eq!(cfg.container_name_prefix, "zoe");
        assert_eq!(cfg.scheduler.backend_timeout_seconds, 60);
    }

    #[test]
    fn auth_type_wire_names() {
        let cfg: ZoeConfig = toml::from_str(r#"auth_type = "ldapsasl""#).unwrap();
        assert_eq!(cfg.auth_type, AuthType::LdapSasl);
    }
}
