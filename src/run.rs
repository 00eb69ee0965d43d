//! One bootstrap run for one node
//!
//! A [`BootstrapRun`] owns everything a node needs to answer bootstrap
//! questions: the directory, the clock, configuration, the capability table
//! and the local node itself. Steps are awaited one after another; nothing is
//! spawned. Directory snapshots are cached for the lifetime of the run and
//! dropped with it.

use crate::assembler::{self, AssemblyFlags, AssemblyInputs, ConfigVariables};
use crate::clock::{Clock, SystemClock};
use crate::cluster::{
    CapabilityMap, Expectation, MembershipDirectory, NetworkPlane, Node, NodeFilter, NodePlanes,
    PlaneProvider, Role, ServiceRegistration,
};
use crate::config::{BootstrapConfig, DeploymentGeneration};
use crate::resolver::{AddressResolver, Resolved};
use crate::telemetry::instruments;
use crate::topology::{FacetLayout, Topology};
use crate::tuning::{self, ResourceProfile};
use crate::wait::{
    BypassReason, DirectoryProbe, GateState, ReadinessGate, ReadinessProbe, ServiceWaitEngine,
    WaitRequest,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Builder for [`BootstrapRun`]
pub struct RunBuilder {
    directory: Arc<dyn MembershipDirectory>,
    config: BootstrapConfig,
    capabilities: CapabilityMap,
    clock: Arc<dyn Clock>,
    planes: Arc<dyn PlaneProvider>,
    probe: Option<Arc<dyn ReadinessProbe>>,
}

impl RunBuilder {
    pub fn config(mut self, config: BootstrapConfig) -> Self {
        self.config = config;
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilityMap) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn planes(mut self, planes: Arc<dyn PlaneProvider>) -> Self {
        self.planes = planes;
        self
    }

    /// Replace the directory-backed readiness probe
    pub fn probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Load the local node and start the run.
    pub async fn start(self, node_name: &str) -> Result<BootstrapRun> {
        let local = self
            .directory
            .get_node(node_name)
            .await?
            .ok_or_else(|| Error::UnknownNode(node_name.to_string()))?;
        let local = Arc::new(local);
        let config = Arc::new(self.config);
        let capabilities = Arc::new(self.capabilities);
        let probe: Arc<dyn ReadinessProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(DirectoryProbe::new(self.directory.clone())),
        };

        let waiter = Arc::new(ServiceWaitEngine::new(
            probe,
            self.clock,
            capabilities.clone(),
            config.clone(),
            local.clone(),
        ));
        let resolver = AddressResolver::new(
            self.directory.clone(),
            self.planes.clone(),
            capabilities.clone(),
            config.clone(),
            local.clone(),
            waiter.clone(),
        );

        info!(
            node = %local.name,
            address = %local.address,
            roles = ?local.roles,
            facet = %local.facet_name,
            "Starting bootstrap run"
        );

        Ok(BootstrapRun {
            directory: self.directory,
            planes: self.planes,
            capabilities,
            config,
            local,
            waiter,
            resolver,
            snapshots: Mutex::new(HashMap::new()),
        })
    }
}

/// Bootstrap state of one node for one run
pub struct BootstrapRun {
    directory: Arc<dyn MembershipDirectory>,
    planes: Arc<dyn PlaneProvider>,
    capabilities: Arc<CapabilityMap>,
    config: Arc<BootstrapConfig>,
    local: Arc<Node>,
    waiter: Arc<ServiceWaitEngine>,
    resolver: AddressResolver,
    /// Directory answers by filter, valid for this run only
    snapshots: Mutex<HashMap<NodeFilter, Vec<Node>>>,
}

impl BootstrapRun {
    /// Builder with the system clock, the standard capability table, node
    /// plane bindings and default configuration.
    pub fn builder(directory: Arc<dyn MembershipDirectory>) -> RunBuilder {
        RunBuilder {
            directory,
            config: BootstrapConfig::default(),
            capabilities: CapabilityMap::standard(),
            clock: Arc::new(SystemClock::new()),
            planes: Arc::new(NodePlanes),
            probe: None,
        }
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    pub fn wait_engine(&self) -> &ServiceWaitEngine {
        &self.waiter
    }

    pub async fn resolve_address(&self, role: Role, allow_local_fallback: bool) -> Result<Resolved> {
        self.resolver.resolve_address(role, allow_local_fallback).await
    }

    /// Nodes matching `filter`, queried once per run.
    pub async fn snapshot(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let cached = self.snapshots.lock().get(filter).cloned();
        if let Some(nodes) = cached {
            return Ok(nodes);
        }
        let nodes = self.directory.find_nodes(filter).await?;
        debug!(filter = ?filter, nodes = nodes.len(), "Cached directory snapshot");
        Ok(self
            .snapshots
            .lock()
            .entry(filter.clone())
            .or_insert(nodes)
            .clone())
    }

    /// Classify the layout of `role` from a fresh directory query.
    pub async fn classify(&self, role: Role) -> Result<Topology> {
        let nodes = self.directory.find_nodes(&NodeFilter::role(role)).await?;
        let layout = FacetLayout::from_nodes(&nodes);
        let topology = layout.classify();
        debug!(
            role = %role,
            instances = layout.instance_count(),
            facets = layout.facet_count(),
            topology = %topology,
            "Classified topology"
        );
        Ok(topology)
    }

    pub async fn facet_layout(&self, role: Role) -> Result<FacetLayout> {
        let nodes = self.snapshot(&NodeFilter::role(role)).await?;
        Ok(FacetLayout::from_nodes(&nodes))
    }

    pub async fn facet_names(&self, role: Role) -> Result<Vec<String>> {
        Ok(self.facet_layout(role).await?.facet_names())
    }

    pub async fn facet_addresses(&self, role: Role) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(self
            .facet_layout(role)
            .await?
            .facet_addresses(self.planes.as_ref(), role.plane()))
    }

    /// More than one holder of `role` shares the local node's facet.
    pub async fn local_facet_is_ha(&self, role: Role) -> Result<bool> {
        Ok(self
            .facet_layout(role)
            .await?
            .is_replicated(&self.local.facet_name))
    }

    pub fn is_primary(node: &Node) -> bool {
        node.is_facet_primary()
    }

    /// More than one node holds `role`.
    pub async fn ha_or_federation_active(&self, role: Role) -> Result<bool> {
        Ok(self.snapshot(&NodeFilter::role(role)).await?.len() > 1)
    }

    /// Whether the cluster schedules through a resource manager.
    pub async fn resource_managed(&self) -> Result<bool> {
        match self.config.deployment {
            DeploymentGeneration::Classic => Ok(false),
            DeploymentGeneration::ResourceManaged => Ok(true),
            DeploymentGeneration::Auto => Ok(!self
                .snapshot(&NodeFilter::role(Role::ResourceManager))
                .await?
                .is_empty()),
        }
    }

    pub fn resource_profile(&self) -> ResourceProfile {
        tuning::profile_for(&self.local)
    }

    /// Wait for every prerequisite of `role` before it is started.
    ///
    /// A prerequisite no node holds (and no override names) opens without
    /// waiting. Timeouts are returned as errors and end the run.
    pub async fn gate_startup(&self, role: Role) -> Result<Vec<ReadinessGate>> {
        let local_facet_ha = self.local_facet_is_ha(Role::PrimaryMetadataService).await?;
        let resource_managed = self.resource_managed().await?;

        let mut gates = Vec::new();
        for prerequisite in self.capabilities.prerequisites_of(role) {
            if !prerequisite.applies(local_facet_ha, resource_managed) {
                continue;
            }
            let dependency = prerequisite.role;
            let holders = self
                .directory
                .count_nodes(&NodeFilter::role(dependency))
                .await?;
            let mut request = WaitRequest::for_role(dependency, &self.config);

            if holders == 0 && !self.config.overrides.contains(dependency) {
                info!(role = %role, dependency = %dependency, "Prerequisite absent, not waiting");
                gates.push(ReadinessGate {
                    service: request.service,
                    state: GateState::Bypassed {
                        reason: BypassReason::Absent,
                    },
                });
                continue;
            }

            if prerequisite.expectation == Expectation::All {
                request = request.expecting(holders);
            }
            gates.push(self.waiter.wait_for(request).await?);
        }
        Ok(gates)
    }

    /// Gate every role the local node holds, in role order.
    pub async fn gate_local_roles(&self) -> Result<Vec<ReadinessGate>> {
        let mut gates = Vec::new();
        for role in self.local.roles.iter().copied() {
            gates.extend(self.gate_startup(role).await?);
        }
        Ok(gates)
    }

    /// Announce that the local node runs `role`'s service.
    ///
    /// Returns whether a write was needed.
    pub async fn provide_service(&self, role: Role) -> Result<bool> {
        if !self.local.has_role(role) {
            return Err(Error::Config(format!(
                "node {} cannot provide {} without holding the role",
                self.local.name, role
            )));
        }
        let service = self.config.catalog.service_name(role);
        let address = self.planes.address(&self.local, role.plane());

        let current = self.directory.find_providers(&service).await?;
        let unchanged = current
            .iter()
            .any(|r| r.node == self.local.name && r.address == address && r.is_running());
        if unchanged {
            return Ok(false);
        }

        info!(service = %service, node = %self.local.name, address = %address, "Providing service");
        instruments::record_directory_write("service");
        self.directory
            .provide_service(ServiceRegistration::running(
                service,
                self.local.name.clone(),
                address,
            ))
            .await?;
        Ok(true)
    }

    /// Gather every input and assemble the template variables.
    pub async fn assemble(&self) -> Result<ConfigVariables> {
        let resolver = &self.resolver;
        let resource_managed = self.resource_managed().await?;

        let (job_coordinator_address, resource_manager_address) = if resource_managed {
            (
                Resolved::Absent,
                resolver.resolve_address(Role::ResourceManager, true).await?,
            )
        } else {
            (
                resolver.resolve_address(Role::JobCoordinator, true).await?,
                Resolved::Absent,
            )
        };

        // topology, facet map and local HA all come from one snapshot
        let layout = self.facet_layout(Role::PrimaryMetadataService).await?;
        let metadata_topology = layout.classify();
        let local_facet_ha = layout.is_replicated(&self.local.facet_name);

        let (log_replica_quorum, coordination_quorum) = if local_facet_ha {
            (
                resolver.log_replica_quorum().await?,
                resolver.coordination_quorum().await?,
            )
        } else {
            (String::new(), String::new())
        };

        let inputs = AssemblyInputs {
            metadata_address: resolver
                .resolve_address(Role::PrimaryMetadataService, true)
                .await?,
            metadata_port: resolver.resolve_port(Role::PrimaryMetadataService),
            data_binding: self.planes.binding(&self.local, NetworkPlane::Data),
            compute_binding: self.planes.binding(&self.local, NetworkPlane::Compute),
            job_coordinator_address,
            job_coordinator_port: resolver.resolve_port(Role::JobCoordinator),
            resource_manager_address,
            profile: self.resource_profile(),
            metadata_topology,
            facet_names: layout.facet_names(),
            facet_addresses: layout
                .facet_addresses(self.planes.as_ref(), Role::PrimaryMetadataService.plane()),
            local_facet_ha,
            log_replica_quorum,
            coordination_quorum,
            coordination_server_lines: resolver.coordination_server_lines().await?,
            scheduler_masters: resolver.all_addresses(Role::SchedulerMaster).await?,
            scheduler_agents: resolver.all_addresses(Role::SchedulerAgent).await?,
            log_replica_edits_dir: self
                .local
                .has_role(Role::LogReplica)
                .then(|| self.config.log_replica_edits_dir.clone()),
        };

        let flags = AssemblyFlags {
            resource_managed,
            ha_or_federation: metadata_topology.is_multi_instance(),
        };
        Ok(assembler::assemble(&inputs, flags))
    }
}
