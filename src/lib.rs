//! # clusterboot
//!
//! Topology resolution and dependency bootstrap for role-tagged clusters.
//!
//! Each machine in the cluster carries one or more service roles. While a
//! node provisions itself, clusterboot answers the questions its
//! configuration depends on:
//!
//! - **Where is a service?** The [`resolver`] maps a role to a canonical
//!   address, or to an explicit absent value when the cluster does not run it
//! - **What shape is the cluster?** The [`topology`] classifier tells single
//!   instances, HA pairs, federations and mixed layouts apart
//! - **Can this service start yet?** The [`wait`] engine blocks startup until
//!   prerequisites are running, or fails the run on timeout
//! - **How big should tasks be?** [`tuning`] derives slot counts and heap
//!   sizes from the node's hardware
//!
//! The [`assembler`] flattens all of it into the variable bag that
//! configuration templates are rendered from, and a [`run::BootstrapRun`]
//! sequences the steps for one node.
//!
//! ## Architecture
//!
//! - **Directory**: the only shared state, behind [`cluster::MembershipDirectory`];
//!   in memory for tests, or a JSON file shared by every node
//! - **Run**: one node, one pass, awaited step by step; snapshots cached per run
//! - **Clock**: injected so wait barriers can be tested without real delay

pub mod assembler;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod resolver;
pub mod run;
pub mod telemetry;
pub mod topology;
pub mod tuning;
pub mod wait;

mod error;

pub use error::{Error, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::assembler::{assemble, AssemblyFlags, AssemblyInputs, ConfigVariables};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::cluster::{
        CapabilityMap, FileDirectory, LocalDirectory, MembershipDirectory, NetworkPlane, Node,
        NodeFilter, NodePlanes, PlaneBinding, PlaneProvider, Role, ServiceRegistration,
    };
    pub use crate::config::{BootstrapConfig, DeploymentGeneration, OverrideTable, WaitSettings};
    pub use crate::resolver::{AddressResolver, Resolved};
    pub use crate::run::BootstrapRun;
    pub use crate::topology::{FacetLayout, Topology};
    pub use crate::tuning::{compute_profile, ResourceProfile};
    pub use crate::wait::{GateState, ReadinessGate, ServiceWaitEngine, WaitRequest};
    pub use crate::{Error, Result};
}
