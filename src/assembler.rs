//! Config variable assembly
//!
//! Flattens resolved addresses, topology, quorum strings and the resource
//! profile into the variable bag that configuration templates are rendered
//! from. [`assemble`] does no I/O; everything it needs is gathered up front
//! into [`AssemblyInputs`].
//!
//! Keys always present:
//!
//! | key | value |
//! |-----|-------|
//! | `metadata_address`, `metadata_port` | primary metadata service endpoint (`null` address when absent) |
//! | `data_bind_address`, `data_network_device` | local binding on the data plane |
//! | `compute_bind_address`, `compute_network_device` | local binding on the compute plane |
//! | `max_map_tasks`, `max_reduce_tasks`, `child_java_opts`, `child_ulimit_kb` | task slots and limits |
//! | `io_sort_mb`, `io_sort_factor`, `io_sort_record_percent` | sort tuning |
//! | `metadata_topology` | classification of the metadata service |
//!
//! Depending on the deployment generation either `resource_manager_address`
//! with the container budgets, or `job_coordinator_address` and
//! `job_coordinator_port`. When HA or federation is active, `nameservices`
//! and `metadata_facets`. When the local metadata facet is replicated,
//! `log_replica_quorum` and `coordination_quorum`. Coordination server lines
//! and scheduler lists only when those roles exist, and the edits directory
//! only on log replicas.

use crate::cluster::PlaneBinding;
use crate::resolver::Resolved;
use crate::topology::Topology;
use crate::tuning::ResourceProfile;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// The two switches assembly branches on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyFlags {
    /// Resource-manager scheduling instead of the classic job coordinator
    pub resource_managed: bool,
    /// More than one metadata service instance
    pub ha_or_federation: bool,
}

/// Everything assembly reads, already resolved
#[derive(Debug, Clone)]
pub struct AssemblyInputs {
    pub metadata_address: Resolved,
    pub metadata_port: u16,
    pub data_binding: PlaneBinding,
    pub compute_binding: PlaneBinding,
    pub job_coordinator_address: Resolved,
    pub job_coordinator_port: u16,
    pub resource_manager_address: Resolved,
    pub profile: ResourceProfile,
    pub metadata_topology: Topology,
    pub facet_names: Vec<String>,
    pub facet_addresses: BTreeMap<String, Vec<String>>,
    /// The local node's metadata facet holds more than one instance
    pub local_facet_ha: bool,
    pub log_replica_quorum: String,
    pub coordination_quorum: String,
    pub coordination_server_lines: Vec<String>,
    pub scheduler_masters: Vec<String>,
    pub scheduler_agents: Vec<String>,
    /// Set only when the local node is a log replica
    pub log_replica_edits_dir: Option<String>,
}

/// Flat variable bag handed to template rendering
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ConfigVariables {
    vars: BTreeMap<String, Value>,
}

impl ConfigVariables {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.vars.insert(key.to_string(), value.into());
    }
}

/// Build the variable bag.
pub fn assemble(inputs: &AssemblyInputs, flags: AssemblyFlags) -> ConfigVariables {
    let mut vars = ConfigVariables::default();
    let profile = &inputs.profile;

    vars.set("metadata_address", resolved(&inputs.metadata_address));
    vars.set("metadata_port", inputs.metadata_port);
    vars.set("metadata_topology", inputs.metadata_topology.as_str());

    vars.set("data_bind_address", inputs.data_binding.address.as_str());
    vars.set("data_network_device", inputs.data_binding.device.clone());
    vars.set("compute_bind_address", inputs.compute_binding.address.as_str());
    vars.set("compute_network_device", inputs.compute_binding.device.clone());

    vars.set("max_map_tasks", profile.max_map_tasks);
    vars.set("max_reduce_tasks", profile.max_reduce_tasks);
    vars.set("child_java_opts", profile.child_java_opts());
    vars.set("child_ulimit_kb", profile.child_ulimit_kb);
    vars.set("io_sort_mb", profile.sort_buffer_mb);
    vars.set("io_sort_factor", profile.sort_factor);
    vars.set("io_sort_record_percent", profile.sort_record_percent);

    if flags.resource_managed {
        vars.set("resource_manager_address", resolved(&inputs.resource_manager_address));
        vars.set("node_manager_memory_mb", profile.node_manager_memory_mb);
        vars.set("app_master_memory_mb", profile.app_master_memory_mb);
    } else {
        vars.set("job_coordinator_address", resolved(&inputs.job_coordinator_address));
        vars.set("job_coordinator_port", inputs.job_coordinator_port);
    }

    if flags.ha_or_federation {
        if inputs.metadata_topology == Topology::HaFederation {
            warn!(
                facets = inputs.facet_names.len(),
                "Assembling mixed HA and federated metadata layout"
            );
        }
        vars.set("nameservices", json!(inputs.facet_names));
        vars.set("metadata_facets", json!(inputs.facet_addresses));
    }

    if inputs.local_facet_ha {
        vars.set("log_replica_quorum", non_empty(&inputs.log_replica_quorum));
        vars.set("coordination_quorum", non_empty(&inputs.coordination_quorum));
    }

    if !inputs.coordination_server_lines.is_empty() {
        vars.set("coordination_servers", json!(inputs.coordination_server_lines));
    }
    if !inputs.scheduler_masters.is_empty() {
        vars.set("scheduler_masters", json!(inputs.scheduler_masters));
    }
    if !inputs.scheduler_agents.is_empty() {
        vars.set("scheduler_agents", json!(inputs.scheduler_agents));
    }

    if let Some(dir) = &inputs.log_replica_edits_dir {
        vars.set("log_replica_edits_dir", dir.as_str());
    }

    vars
}

fn resolved(value: &Resolved) -> Value {
    value.as_deref().map_or(Value::Null, Value::from)
}

fn non_empty(value: &str) -> Value {
    if value.is_empty() {
        Value::Null
    } else {
        Value::from(value)
    }
}
