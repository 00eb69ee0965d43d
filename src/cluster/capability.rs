//! Which roles may skip discovery, waiting, or liveness checks for which
//! dependencies, and which dependencies gate each role's startup.

use super::{Node, Role};
use std::collections::HashMap;

/// How many providers of a prerequisite must be running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// At least one provider
    One,
    /// Every node that holds the role
    All,
}

/// A dependency that must be reachable before a role starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerequisite {
    pub role: Role,
    pub expectation: Expectation,
    /// Only enforced when the local metadata facet runs as an HA pair
    pub only_when_ha: bool,
    /// Only enforced for this deployment generation (`Some(true)` =
    /// resource-managed, `Some(false)` = classic)
    pub resource_managed: Option<bool>,
}

impl Prerequisite {
    pub const fn one(role: Role) -> Self {
        Self {
            role,
            expectation: Expectation::One,
            only_when_ha: false,
            resource_managed: None,
        }
    }

    pub const fn all(role: Role) -> Self {
        Self {
            role,
            expectation: Expectation::All,
            only_when_ha: false,
            resource_managed: None,
        }
    }

    pub fn when_ha(mut self) -> Self {
        self.only_when_ha = true;
        self
    }

    pub fn when_resource_managed(mut self, resource_managed: bool) -> Self {
        self.resource_managed = Some(resource_managed);
        self
    }

    pub fn applies(&self, local_facet_ha: bool, resource_managed: bool) -> bool {
        (!self.only_when_ha || local_facet_ha)
            && self.resource_managed.map_or(true, |rm| rm == resource_managed)
    }
}

/// Capability table keyed by dependency role
#[derive(Debug, Clone, Default)]
pub struct CapabilityMap {
    /// dependency -> local roles that make the node its own provider
    self_sufficient: HashMap<Role, Vec<Role>>,
    /// dependency -> local roles that never wait for it
    wait_exempt: HashMap<Role, Vec<Role>>,
    /// dependency -> local roles that resolve it without a liveness check
    liveness_optional: HashMap<Role, Vec<Role>>,
    /// role -> what must be reachable before it starts
    prerequisites: HashMap<Role, Vec<Prerequisite>>,
}

impl CapabilityMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The dependency rules of a storage + compute + table store cluster.
    pub fn standard() -> Self {
        use Role::*;

        let metadata_peers = vec![PrimaryMetadataService, SecondaryMetadataService, LogReplica];

        Self::empty()
            .self_sufficient(PrimaryMetadataService, &[LogReplica])
            .wait_exempt(PrimaryMetadataService, &[LogReplica])
            .wait_exempt(JobCoordinator, &[LogReplica])
            .wait_exempt(ResourceManager, &[LogReplica])
            .liveness_optional(JobCoordinator, &metadata_peers)
            .liveness_optional(ResourceManager, &metadata_peers)
            .prerequisite(StorageWorker, Prerequisite::one(PrimaryMetadataService))
            .prerequisite(SecondaryMetadataService, Prerequisite::one(PrimaryMetadataService))
            .prerequisite(JobCoordinator, Prerequisite::one(PrimaryMetadataService))
            .prerequisite(ResourceManager, Prerequisite::one(PrimaryMetadataService))
            .prerequisite(
                TaskWorker,
                Prerequisite::one(JobCoordinator).when_resource_managed(false),
            )
            .prerequisite(
                TaskWorker,
                Prerequisite::one(ResourceManager).when_resource_managed(true),
            )
            .prerequisite(
                PrimaryMetadataService,
                Prerequisite::all(LogReplica).when_ha(),
            )
            .prerequisite(LogReplica, Prerequisite::all(CoordinationPeer))
            .prerequisite(TableMaster, Prerequisite::all(CoordinationPeer))
            .prerequisite(TableMaster, Prerequisite::one(PrimaryMetadataService))
            .prerequisite(TableServer, Prerequisite::one(TableMaster))
    }

    pub fn self_sufficient(mut self, dependency: Role, roles: &[Role]) -> Self {
        self.self_sufficient
            .entry(dependency)
            .or_default()
            .extend_from_slice(roles);
        self
    }

    pub fn wait_exempt(mut self, dependency: Role, roles: &[Role]) -> Self {
        self.wait_exempt
            .entry(dependency)
            .or_default()
            .extend_from_slice(roles);
        self
    }

    pub fn liveness_optional(mut self, dependency: Role, roles: &[Role]) -> Self {
        self.liveness_optional
            .entry(dependency)
            .or_default()
            .extend_from_slice(roles);
        self
    }

    pub fn prerequisite(mut self, role: Role, prerequisite: Prerequisite) -> Self {
        self.prerequisites.entry(role).or_default().push(prerequisite);
        self
    }

    /// The node answers for `dependency` itself.
    pub fn provides_locally(&self, node: &Node, dependency: Role) -> bool {
        node.has_role(dependency) || Self::holds_any(&self.self_sufficient, node, dependency)
    }

    /// The node never blocks on `dependency`.
    pub fn is_wait_exempt(&self, node: &Node, dependency: Role) -> bool {
        Self::holds_any(&self.wait_exempt, node, dependency)
    }

    /// The node may resolve `dependency` without confirming it is running.
    pub fn is_liveness_optional(&self, node: &Node, dependency: Role) -> bool {
        Self::holds_any(&self.liveness_optional, node, dependency)
    }

    pub fn prerequisites_of(&self, role: Role) -> &[Prerequisite] {
        self.prerequisites
            .get(&role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn holds_any(table: &HashMap<Role, Vec<Role>>, node: &Node, dependency: Role) -> bool {
        table
            .get(&dependency)
            .map_or(false, |roles| roles.iter().any(|r| node.has_role(*r)))
    }
}
