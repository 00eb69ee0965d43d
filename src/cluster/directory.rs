//! Membership directory interface
//!
//! The directory is the only state shared between nodes. It is eventually
//! consistent: a node registered a moment ago may not be visible yet, and an
//! empty answer is a normal result rather than a failure.

use super::{Node, NodeFilter};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a service instance as announced by its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopped,
}

/// A node's announcement that it provides a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service: String,
    pub node: String,
    /// Address the provider reported for the service's plane
    pub address: String,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
}

impl ServiceRegistration {
    pub fn running(
        service: impl Into<String>,
        node: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            node: node.into(),
            address: address.into(),
            status: ServiceStatus::Running,
            registered_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ServiceStatus::Running
    }
}

/// Membership directory client
///
/// Implementations must return nodes and providers sorted by address so every
/// node in the cluster derives the same answer from the same membership.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Nodes matching the filter. No match is an empty vec, not an error.
    async fn find_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Look up one node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Record the address a node resolved for itself
    async fn register_address(&self, node: &str, address: &str) -> Result<()>;

    /// Announce (or update) a service instance
    async fn provide_service(&self, registration: ServiceRegistration) -> Result<()>;

    /// Every announced instance of a service
    async fn find_providers(&self, service: &str) -> Result<Vec<ServiceRegistration>>;

    /// Record the externally visible address of a facet
    async fn register_facet_identity(&self, facet: &str, address: &str) -> Result<()>;

    /// Address registered for a facet, if any
    async fn facet_identity(&self, facet: &str) -> Result<Option<String>>;

    async fn count_nodes(&self, filter: &NodeFilter) -> Result<usize> {
        Ok(self.find_nodes(filter).await?.len())
    }
}
