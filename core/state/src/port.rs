//! Port records materialized after the backend assigns external addresses

use serde::{Deserialize, Serialize};

/// External address of one declared service port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: i64,
    pub service_id: i64,

    /// `<port-number>/<protocol>`, matching the declaration
    pub internal_name: String,

    pub external_ip: Option<String>,
    pub external_port: Option<u16>,
}

impl Port {
    /// `ip:port` string, when an external address has been assigned.
    pub fn external_address(&self) -> Option<String> {
        match (&self.external_ip, self.external_port) {
            (Some(ip), Some(port)) => Some(format!("{}:{}", ip, port)),
            _ => None,
        }
    }
}
