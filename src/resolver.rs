//! Address resolution
//!
//! Maps a role to the address peers should use to reach it. In order:
//!
//! 1. the local node, when it provides the role (or a role that stands in for
//!    it) and local fallback is allowed; the primary of a replicated facet
//!    also registers the facet's identity
//! 2. an operator override, trusted as-is
//! 3. the first directory node holding the role, after the wait barrier
//!    confirms the service is running, unless the local role class may
//!    resolve it without that check
//! 4. otherwise [`Resolved::Absent`]: the cluster does not run the role
//!
//! Absence is never an error and never blocks.

use crate::cluster::{
    CapabilityMap, MembershipDirectory, Node, NodeFilter, PlaneProvider, Role,
};
use crate::config::BootstrapConfig;
use crate::telemetry::instruments;
use crate::topology::FacetLayout;
use crate::wait::{ServiceWaitEngine, WaitRequest};
use crate::Result;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Resolved address or the explicit absent sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolved {
    Address(String),
    /// No node holds the role and no override exists
    Absent,
}

impl Resolved {
    pub fn as_deref(&self) -> Option<&str> {
        match self {
            Resolved::Address(addr) => Some(addr),
            Resolved::Absent => None,
        }
    }

}

impl fmt::Display for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolved::Address(addr) => f.write_str(addr),
            Resolved::Absent => f.write_str("<absent>"),
        }
    }
}

impl Serialize for Resolved {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Resolved::Address(addr) => serializer.serialize_str(addr),
            Resolved::Absent => serializer.serialize_none(),
        }
    }
}

/// Resolves dependency addresses for the local node
pub struct AddressResolver {
    directory: Arc<dyn MembershipDirectory>,
    planes: Arc<dyn PlaneProvider>,
    capabilities: Arc<CapabilityMap>,
    config: Arc<BootstrapConfig>,
    local: Arc<Node>,
    waiter: Arc<ServiceWaitEngine>,
}

impl AddressResolver {
    pub fn new(
        directory: Arc<dyn MembershipDirectory>,
        planes: Arc<dyn PlaneProvider>,
        capabilities: Arc<CapabilityMap>,
        config: Arc<BootstrapConfig>,
        local: Arc<Node>,
        waiter: Arc<ServiceWaitEngine>,
    ) -> Self {
        Self {
            directory,
            planes,
            capabilities,
            config,
            local,
            waiter,
        }
    }

    /// Canonical address of `role`, or [`Resolved::Absent`].
    ///
    /// `allow_local_fallback` lets a node that provides the role answer with
    /// its own address; with it off, the node resolves like any other peer.
    pub async fn resolve_address(&self, role: Role, allow_local_fallback: bool) -> Result<Resolved> {
        let plane = role.plane();

        if allow_local_fallback && self.capabilities.provides_locally(&self.local, role) {
            let address = self.planes.address(&self.local, plane);
            self.self_register(&address).await?;
            if self.local.has_role(role) {
                self.register_facet_identity(role, &address).await?;
            }
            debug!(role = %role, address = %address, "Resolved role to local node");
            instruments::record_resolution(role.as_str(), "local");
            return Ok(Resolved::Address(address));
        }

        if let Some(entry) = self.config.overrides.get(role) {
            debug!(role = %role, address = %entry.address, "Resolved role from override");
            instruments::record_resolution(role.as_str(), "override");
            return Ok(Resolved::Address(entry.address.clone()));
        }

        let holders = self.directory.find_nodes(&NodeFilter::role(role)).await?;
        let Some(first) = holders.first() else {
            info!(role = %role, "No node holds role, dependency absent");
            instruments::record_resolution(role.as_str(), "absent");
            return Ok(Resolved::Absent);
        };

        if self.capabilities.is_liveness_optional(&self.local, role) {
            let address = self.planes.address(first, plane);
            debug!(role = %role, address = %address, "Resolved role without liveness check");
            instruments::record_resolution(role.as_str(), "directory");
            return Ok(Resolved::Address(address));
        }

        self.waiter
            .wait_for(WaitRequest::for_role(role, &self.config))
            .await?;

        // Prefer the address the running provider announced for itself.
        let service = self.config.catalog.service_name(role);
        let providers = self.directory.find_providers(&service).await?;
        let address = providers
            .iter()
            .find(|p| p.is_running())
            .map(|p| p.address.clone())
            .unwrap_or_else(|| self.planes.address(first, plane));
        info!(role = %role, address = %address, "Resolved role from running provider");
        instruments::record_resolution(role.as_str(), "running_provider");
        Ok(Resolved::Address(address))
    }

    /// Override port, else the configured port of the role's service.
    pub fn resolve_port(&self, role: Role) -> u16 {
        self.config
            .overrides
            .get(role)
            .and_then(|o| o.port)
            .unwrap_or_else(|| self.config.catalog.port(role))
    }

    /// Plane addresses of every node holding `role`, sorted.
    pub async fn all_addresses(&self, role: Role) -> Result<Vec<String>> {
        let holders = self.directory.find_nodes(&NodeFilter::role(role)).await?;
        let mut addresses: Vec<String> = holders
            .iter()
            .map(|n| self.planes.address(n, role.plane()))
            .collect();
        addresses.sort();
        addresses.dedup();
        Ok(addresses)
    }

    /// `addr:port;addr:port` over every log replica.
    pub async fn log_replica_quorum(&self) -> Result<String> {
        let port = self.resolve_port(Role::LogReplica);
        Ok(self
            .all_addresses(Role::LogReplica)
            .await?
            .iter()
            .map(|addr| format!("{addr}:{port}"))
            .collect::<Vec<_>>()
            .join(";"))
    }

    /// `addr:port,addr:port` over every coordination peer.
    pub async fn coordination_quorum(&self) -> Result<String> {
        let port = self.resolve_port(Role::CoordinationPeer);
        Ok(self
            .all_addresses(Role::CoordinationPeer)
            .await?
            .iter()
            .map(|addr| format!("{addr}:{port}"))
            .collect::<Vec<_>>()
            .join(","))
    }

    /// Ensemble membership lines for coordination peers.
    pub async fn coordination_server_lines(&self) -> Result<Vec<String>> {
        let peers = self.all_addresses(Role::CoordinationPeer).await?;
        Ok(server_lines(
            &peers,
            self.config.coordination_peer_port,
            self.config.coordination_leader_port,
        ))
    }

    /// Write the local node's address into the directory when it changed.
    async fn self_register(&self, address: &str) -> Result<()> {
        let current = self
            .directory
            .get_node(&self.local.name)
            .await?
            .and_then(|n| n.registered_address);
        if current.as_deref() == Some(address) {
            return Ok(());
        }
        info!(node = %self.local.name, address = %address, "Self-registering address");
        instruments::record_directory_write("address");
        self.directory
            .register_address(&self.local.name, address)
            .await
    }

    /// Register the facet's external address once, from its index-0 member.
    ///
    /// Replicas and unreplicated facets write nothing.
    async fn register_facet_identity(&self, role: Role, address: &str) -> Result<()> {
        let facet = self.local.facet_name.as_str();
        if facet.is_empty() {
            return Ok(());
        }
        let members = self
            .directory
            .find_nodes(&NodeFilter::role(role).in_facet(facet))
            .await?;
        let layout = FacetLayout::from_nodes(&members);
        let is_primary = layout
            .primary_of(facet)
            .is_some_and(|p| p.name == self.local.name);
        if !layout.is_replicated(facet) || !is_primary {
            return Ok(());
        }

        if self.directory.facet_identity(facet).await?.as_deref() == Some(address) {
            return Ok(());
        }
        info!(facet = %facet, node = %self.local.name, address = %address, "Registering facet identity");
        instruments::record_directory_write("facet_identity");
        self.directory.register_facet_identity(facet, address).await
    }
}

/// `server.N=addr:peer:leader` per peer; a lone peer gets an unnumbered line.
pub fn server_lines(peers: &[String], peer_port: u16, leader_port: u16) -> Vec<String> {
    match peers {
        [] => Vec::new(),
        [only] => vec![format!("server={only}:{peer_port}:{leader_port}")],
        _ => peers
            .iter()
            .enumerate()
            .map(|(i, addr)| format!("server.{i}={addr}:{peer_port}:{leader_port}"))
            .collect(),
    }
}
