//! Bootstrap configuration
//!
//! Everything an operator can tune about a bootstrap run: wait barrier
//! timing, per-role address overrides that bypass discovery, service names
//! and ports, and the deployment generation. Values come from
//! [`BootstrapConfig::default`] and can be layered from the environment.

use crate::cluster::Role;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Timing of the service-wait barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    /// Fixed delay between polls; no jitter or backoff
    pub poll_interval: Duration,
    /// Abandon the wait (fatally) once this much time has passed
    pub timeout: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Operator-supplied endpoint for a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub address: String,
    pub port: Option<u16>,
}

impl std::str::FromStr for Override {
    type Err = Error;

    /// Parses `host` or `host:port`.
    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::Config("override address cannot be empty".to_string()));
        }
        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port = port.parse::<u16>().map_err(|e| {
                    Error::Config(format!("invalid override port in '{value}': {e}"))
                })?;
                Ok(Self {
                    address: host.to_string(),
                    port: Some(port),
                })
            }
            _ => Ok(Self {
                address: value.to_string(),
                port: None,
            }),
        }
    }
}

/// Per-role overrides that bypass discovery and waiting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    entries: BTreeMap<Role, Override>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: Role, address: impl Into<String>, port: Option<u16>) -> Self {
        self.insert(
            role,
            Override {
                address: address.into(),
                port,
            },
        );
        self
    }

    pub fn insert(&mut self, role: Role, entry: Override) {
        self.entries.insert(role, entry);
    }

    pub fn get(&self, role: Role) -> Option<&Override> {
        self.entries.get(&role)
    }

    pub fn contains(&self, role: Role) -> bool {
        self.entries.contains_key(&role)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Service names and ports per role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    names: BTreeMap<Role, String>,
    ports: BTreeMap<Role, u16>,
}

impl ServiceCatalog {
    /// Name providers announce the role's service under
    pub fn service_name(&self, role: Role) -> String {
        self.names
            .get(&role)
            .cloned()
            .unwrap_or_else(|| role.as_str().to_string())
    }

    pub fn port(&self, role: Role) -> u16 {
        self.ports.get(&role).copied().unwrap_or_else(|| role.default_port())
    }

    pub fn set_service_name(&mut self, role: Role, name: impl Into<String>) {
        self.names.insert(role, name.into());
    }

    pub fn set_port(&mut self, role: Role, port: u16) {
        self.ports.insert(role, port);
    }
}

/// Which compute layer the cluster runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentGeneration {
    /// Classic job coordinator + task workers
    Classic,
    /// Resource manager based scheduling
    ResourceManaged,
    /// Resource-managed when any node holds the resource-manager role
    #[default]
    Auto,
}

impl std::str::FromStr for DeploymentGeneration {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(Self::Classic),
            "resource-managed" | "resource_managed" | "yarn" => Ok(Self::ResourceManaged),
            "auto" => Ok(Self::Auto),
            other => Err(Error::Config(format!(
                "unknown deployment generation '{}'; expected one of classic, resource-managed, auto",
                other
            ))),
        }
    }
}

/// Configuration for one bootstrap run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub wait: WaitSettings,
    pub overrides: OverrideTable,
    pub catalog: ServiceCatalog,
    pub deployment: DeploymentGeneration,
    /// Ensemble peer-to-peer port for coordination peers
    pub coordination_peer_port: u16,
    /// Ensemble leader election port for coordination peers
    pub coordination_leader_port: u16,
    /// Where log replicas keep their edits
    pub log_replica_edits_dir: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            wait: WaitSettings::default(),
            overrides: OverrideTable::default(),
            catalog: ServiceCatalog::default(),
            deployment: DeploymentGeneration::Auto,
            coordination_peer_port: 2888,
            coordination_leader_port: 3888,
            log_replica_edits_dir: "/var/lib/log-replica".to_string(),
        }
    }
}

impl BootstrapConfig {
    /// Create configuration from environment
    ///
    /// Environment variables:
    /// - CLUSTERBOOT_WAIT_POLL_SECS: poll interval of wait barriers (default: 5)
    /// - CLUSTERBOOT_WAIT_TIMEOUT_SECS: wait barrier timeout (default: 600)
    /// - CLUSTERBOOT_DEPLOYMENT: classic, resource-managed or auto (default: auto)
    /// - CLUSTERBOOT_OVERRIDE_<ROLE>: host[:port] bypassing discovery, e.g.
    ///   CLUSTERBOOT_OVERRIDE_JOB_COORDINATOR=10.1.0.5:8021
    /// - CLUSTERBOOT_SERVICE_<ROLE>: service name providers announce
    /// - CLUSTERBOOT_PORT_<ROLE>: service port
    /// - CLUSTERBOOT_LOG_REPLICA_EDITS_DIR: edits directory on log replicas
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_secs(&lookup, "CLUSTERBOOT_WAIT_POLL_SECS")? {
            config.wait.poll_interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "CLUSTERBOOT_WAIT_TIMEOUT_SECS")? {
            config.wait.timeout = secs;
        }
        if config.wait.poll_interval.is_zero() {
            return Err(Error::Config(
                "CLUSTERBOOT_WAIT_POLL_SECS must be greater than zero".to_string(),
            ));
        }

        if let Some(raw) = lookup("CLUSTERBOOT_DEPLOYMENT") {
            config.deployment = raw.parse()?;
        }
        if let Some(dir) = lookup("CLUSTERBOOT_LOG_REPLICA_EDITS_DIR") {
            config.log_replica_edits_dir = dir;
        }

        for role in Role::ALL {
            let key = role.env_key();
            if let Some(raw) = lookup(&format!("CLUSTERBOOT_OVERRIDE_{key}")) {
                let entry: Override = raw.parse()?;
                info!(role = %role, address = %entry.address, "Using operator override");
                config.overrides.insert(role, entry);
            }
            if let Some(name) = lookup(&format!("CLUSTERBOOT_SERVICE_{key}")) {
                config.catalog.set_service_name(role, name);
            }
            let port_var = format!("CLUSTERBOOT_PORT_{key}");
            if let Some(raw) = lookup(&port_var) {
                let port = raw.trim().parse::<u16>().map_err(|e| {
                    Error::Config(format!("{port_var} must be a port number: {e}"))
                })?;
                config.catalog.set_port(role, port);
            }
        }

        Ok(config)
    }
}

fn parse_secs<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|e| Error::Config(format!("{name} must be a whole number of seconds: {e}")))
}
