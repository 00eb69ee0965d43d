//! Local in-memory membership directory for development and testing

use super::{MembershipDirectory, Node, NodeFilter, ServiceRegistration};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// On-disk membership snapshot: the nodes of a cluster, the services they
/// have announced so far and the registered facet identities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipFile {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub services: Vec<ServiceRegistration>,
    /// facet name -> externally visible address
    #[serde(default)]
    pub facets: BTreeMap<String, String>,
}

impl MembershipFile {
    /// Read and validate a JSON membership file.
    pub async fn read(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await?;
        let membership: MembershipFile = serde_json::from_slice(&raw)?;
        membership.validate().map_err(|e| match e {
            Error::Config(msg) => {
                Error::Config(format!("membership file {}: {}", path.display(), msg))
            }
            other => other,
        })?;
        Ok(membership)
    }

    /// Node names are unique, and so is each facet index within its facet.
    /// Nodes outside any facet carry no index and are not checked.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut slots = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::Config(format!("node {} is listed twice", node.name)));
            }
            if node.facet_name.is_empty() {
                continue;
            }
            if !slots.insert((node.facet_name.as_str(), node.facet_index)) {
                return Err(Error::Config(format!(
                    "node {} reuses index {} in facet {}",
                    node.name, node.facet_index, node.facet_name
                )));
            }
        }
        Ok(())
    }
}

/// Local in-memory membership directory
///
/// Suitable for tests, single-node deployments, and clusters whose membership
/// is handed to each node as a file. Counts writes so callers can verify that
/// self-registration is idempotent.
#[derive(Debug, Default)]
pub struct LocalDirectory {
    /// Node by name
    nodes: DashMap<String, Node>,
    /// Registration by (service, node)
    services: DashMap<(String, String), ServiceRegistration>,
    /// Facet identity by facet name
    facets: DashMap<String, String>,
    /// Number of mutating calls received
    writes: AtomicU64,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_membership(membership: MembershipFile) -> Self {
        let directory = Self::new();
        for node in membership.nodes {
            directory.nodes.insert(node.name.clone(), node);
        }
        for registration in membership.services {
            directory.insert_registration(registration);
        }
        for (facet, address) in membership.facets {
            directory.facets.insert(facet, address);
        }
        directory
    }

    /// Load membership from a JSON file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let membership = MembershipFile::read(path).await?;
        info!(
            path = %path.display(),
            nodes = membership.nodes.len(),
            services = membership.services.len(),
            "Loaded cluster membership"
        );
        Ok(Self::from_membership(membership))
    }

    /// Add or replace a node
    pub fn upsert_node(&self, node: Node) {
        debug!(node = %node.name, address = %node.address, "Upserting node");
        self.nodes.insert(node.name.clone(), node);
    }

    /// Number of mutating calls received through the directory interface
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Current contents, sorted the way queries return them
    pub fn snapshot(&self) -> MembershipFile {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|e| e.value().clone()).collect();
        sort_nodes(&mut nodes);
        let mut services: Vec<ServiceRegistration> =
            self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by(|a, b| (&a.service, &a.address).cmp(&(&b.service, &b.address)));
        let facets = self
            .facets
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        MembershipFile {
            nodes,
            services,
            facets,
        }
    }

    pub(super) fn set_registered_address(&self, node: &str, address: &str) -> Result<()> {
        let mut entry = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        entry.registered_address = Some(address.to_string());
        Ok(())
    }

    pub(super) fn insert_registration(&self, registration: ServiceRegistration) {
        self.services.insert(
            (registration.service.clone(), registration.node.clone()),
            registration,
        );
    }

    pub(super) fn set_facet_identity(&self, facet: &str, address: &str) {
        self.facets.insert(facet.to_string(), address.to_string());
    }
}

#[async_trait]
impl MembershipDirectory for LocalDirectory {
    async fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes.get(name).map(|e| e.value().clone()))
    }

    async fn register_address(&self, node: &str, address: &str) -> Result<()> {
        self.set_registered_address(node, address)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn provide_service(&self, registration: ServiceRegistration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.insert_registration(registration);
        Ok(())
    }

    async fn find_providers(&self, service: &str) -> Result<Vec<ServiceRegistration>> {
        let mut providers: Vec<ServiceRegistration> = self
            .services
            .iter()
            .filter(|e| e.key().0 == service)
            .map(|e| e.value().clone())
            .collect();
        providers.sort_by(|a, b| (&a.address, &a.node).cmp(&(&b.address, &b.node)));
        Ok(providers)
    }

    async fn register_facet_identity(&self, facet: &str, address: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.set_facet_identity(facet, address);
        Ok(())
    }

    async fn facet_identity(&self, facet: &str) -> Result<Option<String>> {
        Ok(self.facets.get(facet).map(|e| e.value().clone()))
    }
}

/// Address first, name as the tie-break for nodes sharing an address.
fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| (&a.address, &a.name).cmp(&(&b.address, &b.name)));
}
