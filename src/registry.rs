//! Host inventory.
//!
//! Built once from [`AgentConfig`] at startup and shared read-only between
//! request handlers. There is no update path.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{expand_path, AgentConfig, HostConfig};
use crate::error::{FleetError, Result};

/// How commands reach a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Commands run in-process on the agent's machine.
    Local,
    /// Commands run over SSH.
    Remote,
}

/// Role of a host in the fleet. Only the hub runs supervisor-managed services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    Hub,
    #[default]
    Member,
}

/// A managed host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    pub key: String,
    pub name: String,
    pub mode: ConnectionMode,
    pub role: HostRole,
    pub address: String,
    pub user: String,
    pub port: u16,
    /// Credential reference, only read by the SSH transport.
    #[serde(skip)]
    pub key_path: Option<PathBuf>,
    pub services: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub os_services: Vec<String>,
    #[serde(skip)]
    pub reboot_command: Option<String>,
}

impl Host {
    pub fn is_local(&self) -> bool {
        self.mode == ConnectionMode::Local
    }

    pub fn is_hub(&self) -> bool {
        self.role == HostRole::Hub
    }
}

impl From<&HostConfig> for Host {
    fn from(config: &HostConfig) -> Self {
        Self {
            key: config.key.clone(),
            name: config.name.clone(),
            mode: config.mode,
            role: config.role,
            address: config.address.clone(),
            user: config.user.clone(),
            port: config.port,
            key_path: config.key_path.as_deref().map(expand_path),
            services: config.services.clone(),
            os_services: config.os_services.clone(),
            reboot_command: config.reboot_command.clone(),
        }
    }
}

/// Immutable host inventory plus the naming rule used to pick a supervisor.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    reserved_prefix: String,
}

impl HostRegistry {
    pub fn new(hosts: Vec<Host>, reserved_prefix: impl Into<String>) -> Self {
        Self {
            hosts,
            reserved_prefix: reserved_prefix.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.hosts.iter().map(Host::from).collect(),
            config.reserved_prefix.clone(),
        )
    }

    pub fn lookup(&self, key: &str) -> Result<&Host> {
        self.hosts
            .iter()
            .find(|h| h.key == key)
            .ok_or_else(|| FleetError::UnknownHost(key.to_string()))
    }

    /// Host keys in configuration order.
    pub fn keys(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.key.as_str()).collect()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// The host the agent itself runs on, if one is configured.
    pub fn local(&self) -> Option<&Host> {
        self.hosts.iter().find(|h| h.is_local())
    }

    pub fn reserved_prefix(&self) -> &str {
        &self.reserved_prefix
    }
}
