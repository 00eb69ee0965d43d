//! Cluster membership model
//!
//! Nodes, the closed set of service roles they can carry, the logical network
//! planes they bind to, and the membership directory through which a node
//! discovers its peers.

pub mod capability;
pub mod directory;
pub mod file;
pub mod local;

pub use capability::{CapabilityMap, Expectation, Prerequisite};
pub use directory::{MembershipDirectory, ServiceRegistration, ServiceStatus};
pub use file::FileDirectory;
pub use local::{LocalDirectory, MembershipFile};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Service role a node can be tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Filesystem metadata service (one per facet, paired for HA)
    #[serde(alias = "metadata-service")]
    PrimaryMetadataService,
    /// Checkpointing companion of the metadata service
    SecondaryMetadataService,
    /// Classic job coordinator
    JobCoordinator,
    /// Next-generation resource manager
    ResourceManager,
    /// Shared edit-log replica used by HA metadata pairs
    LogReplica,
    /// Coordination ensemble member
    CoordinationPeer,
    /// Block storage worker
    StorageWorker,
    /// Task execution worker
    TaskWorker,
    /// Table store master
    TableMaster,
    /// Table store region server
    TableServer,
    /// Cluster scheduler master
    SchedulerMaster,
    /// Cluster scheduler agent
    SchedulerAgent,
}

impl Role {
    pub const ALL: [Role; 12] = [
        Role::PrimaryMetadataService,
        Role::SecondaryMetadataService,
        Role::JobCoordinator,
        Role::ResourceManager,
        Role::LogReplica,
        Role::CoordinationPeer,
        Role::StorageWorker,
        Role::TaskWorker,
        Role::TableMaster,
        Role::TableServer,
        Role::SchedulerMaster,
        Role::SchedulerAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::PrimaryMetadataService => "primary-metadata-service",
            Role::SecondaryMetadataService => "secondary-metadata-service",
            Role::JobCoordinator => "job-coordinator",
            Role::ResourceManager => "resource-manager",
            Role::LogReplica => "log-replica",
            Role::CoordinationPeer => "coordination-peer",
            Role::StorageWorker => "storage-worker",
            Role::TaskWorker => "task-worker",
            Role::TableMaster => "table-master",
            Role::TableServer => "table-server",
            Role::SchedulerMaster => "scheduler-master",
            Role::SchedulerAgent => "scheduler-agent",
        }
    }

    /// Network plane the role's service listens on.
    pub fn plane(&self) -> NetworkPlane {
        match self {
            Role::JobCoordinator | Role::ResourceManager | Role::TaskWorker => {
                NetworkPlane::Compute
            }
            _ => NetworkPlane::Data,
        }
    }

    /// Well-known port of the role's service when no override is configured.
    pub fn default_port(&self) -> u16 {
        match self {
            Role::PrimaryMetadataService => 8020,
            Role::SecondaryMetadataService => 50090,
            Role::JobCoordinator => 8021,
            Role::ResourceManager => 8032,
            Role::LogReplica => 8485,
            Role::CoordinationPeer => 2181,
            Role::StorageWorker => 50010,
            Role::TaskWorker => 50060,
            Role::TableMaster => 60000,
            Role::TableServer => 60020,
            Role::SchedulerMaster => 5050,
            Role::SchedulerAgent => 5051,
        }
    }

    /// Roles whose daemons reserve enough memory to shrink the task heap.
    pub fn is_memory_heavy(&self) -> bool {
        matches!(
            self,
            Role::StorageWorker | Role::TaskWorker | Role::TableServer
        )
    }

    /// Key used in environment variable names, e.g. `JOB_COORDINATOR`.
    pub fn env_key(&self) -> String {
        self.as_str().replace('-', "_").to_ascii_uppercase()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim().to_ascii_lowercase().replace('_', "-");
        if value == "metadata-service" {
            return Ok(Role::PrimaryMetadataService);
        }
        Role::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == value)
            .ok_or(Error::UnknownRole(value))
    }
}

/// Logical network a node binds services to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPlane {
    /// Storage traffic
    Data,
    /// Job and task traffic
    Compute,
}

/// Address and device a node exposes on one plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneBinding {
    pub address: String,
    #[serde(default)]
    pub device: Option<String>,
}

/// Hardware snapshot reported by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cores: u32,
    pub memory_bytes: u64,
}

impl ResourceSnapshot {
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }
}

/// A cluster member as seen through the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable node name
    pub name: String,
    /// Identity address; also the fallback for every plane
    pub address: String,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    /// Logical sub-group, e.g. one HA pair
    #[serde(default)]
    pub facet_name: String,
    /// Ordinal within the facet; 0 is the facet's primary
    #[serde(default)]
    pub facet_index: u32,
    #[serde(default)]
    pub resources: ResourceSnapshot,
    #[serde(default)]
    pub planes: BTreeMap<NetworkPlane, PlaneBinding>,
    /// Address last self-registered by the node
    #[serde(default)]
    pub registered_address: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            roles: BTreeSet::new(),
            facet_name: String::new(),
            facet_index: 0,
            resources: ResourceSnapshot::default(),
            planes: BTreeMap::new(),
            registered_address: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn in_facet(mut self, facet_name: impl Into<String>, facet_index: u32) -> Self {
        self.facet_name = facet_name.into();
        self.facet_index = facet_index;
        self
    }

    pub fn with_resources(mut self, cores: u32, memory_mb: u64) -> Self {
        self.resources = ResourceSnapshot {
            cores,
            memory_bytes: memory_mb * 1024 * 1024,
        };
        self
    }

    pub fn with_plane(mut self, plane: NetworkPlane, binding: PlaneBinding) -> Self {
        self.planes.insert(plane, binding);
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Facet-index-0 member registers the facet's external identity.
    pub fn is_facet_primary(&self) -> bool {
        self.facet_index == 0
    }

    /// Number of memory-heavy roles this node hosts.
    pub fn co_located_heavy_roles(&self) -> u32 {
        self.roles.iter().filter(|r| r.is_memory_heavy()).count() as u32
    }
}

/// Directory query filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeFilter {
    pub role: Option<Role>,
    pub facet: Option<String>,
}

impl NodeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            facet: None,
        }
    }

    pub fn in_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = Some(facet.into());
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        self.role.map_or(true, |r| node.has_role(r))
            && self.facet.as_ref().map_or(true, |f| &node.facet_name == f)
    }
}

/// Bind address and device lookup for a logical plane
pub trait PlaneProvider: Send + Sync {
    fn address(&self, node: &Node, plane: NetworkPlane) -> String;

    fn device(&self, node: &Node, plane: NetworkPlane) -> Option<String>;

    fn binding(&self, node: &Node, plane: NetworkPlane) -> PlaneBinding {
        PlaneBinding {
            address: self.address(node, plane),
            device: self.device(node, plane),
        }
    }
}

/// Reads plane bindings recorded on the node, falling back to its identity
/// address when the plane is not configured separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodePlanes;

impl PlaneProvider for NodePlanes {
    fn address(&self, node: &Node, plane: NetworkPlane) -> String {
        node.planes
            .get(&plane)
            .map(|b| b.address.clone())
            .unwrap_or_else(|| node.address.clone())
    }

    fn device(&self, node: &Node, plane: NetworkPlane) -> Option<String> {
        node.planes.get(&plane).and_then(|b| b.device.clone())
    }
}
