//! Per-node resource tuning
//!
//! Sizes task slots and child heaps from the node's cores and memory:
//!
//! ```text
//! n_mappers       = 2 + floor(cores * 2/3)
//! n_reducers      = 2 + floor(cores * 1/3)
//! sort_buffer_mb  = 300 if memory_mb > 4096 else 100
//! heap_mb         = max(256, floor((memory_mb - 1024 - sort_buffer_mb * n_mappers
//!                       - 1024 * co_located_roles * 0.6) / (n_mappers + n_reducers)))
//! child_ulimit_kb = 3 * heap_mb * 1024
//! ```
//!
//! 1024 MB is held back for the OS and daemons, each co-located memory-heavy
//! role reserves another 0.6 GB, and the rest is split evenly across slots.
//! The ulimit leaves 3x the heap for off-heap and native memory.

use crate::cluster::Node;
use serde::{Deserialize, Serialize};

pub const MIN_HEAP_MB: u64 = 256;
const OS_RESERVE_MB: f64 = 1024.0;
const CO_LOCATED_ROLE_RESERVE_MB: f64 = 1024.0 * 0.6;
const LARGE_SORT_BUFFER_MB: u64 = 300;
const SMALL_SORT_BUFFER_MB: u64 = 100;
const LARGE_MEMORY_THRESHOLD_MB: u64 = 4096;
const SORT_FACTOR: u32 = 10;
const SORT_RECORD_PERCENT: f64 = 0.14;
const MIN_APP_MASTER_MB: u64 = 1536;

/// Derived per-node limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub max_map_tasks: u32,
    pub max_reduce_tasks: u32,
    pub child_heap_mb: u64,
    pub child_ulimit_kb: u64,
    pub sort_buffer_mb: u64,
    pub sort_factor: u32,
    pub sort_record_percent: f64,
    /// Memory a node manager may hand out to containers
    pub node_manager_memory_mb: u64,
    /// Container size for application masters
    pub app_master_memory_mb: u64,
}

impl ResourceProfile {
    /// JVM options for task children
    pub fn child_java_opts(&self) -> String {
        format!("-Xmx{}m", self.child_heap_mb)
    }
}

/// Compute the profile. Total over every input; never fails.
pub fn compute_profile(core_count: u32, memory_mb: u64, co_located_role_count: u32) -> ResourceProfile {
    let n_mappers = 2 + core_count.saturating_mul(2) / 3;
    let n_reducers = 2 + core_count / 3;
    let sort_buffer_mb = if memory_mb > LARGE_MEMORY_THRESHOLD_MB {
        LARGE_SORT_BUFFER_MB
    } else {
        SMALL_SORT_BUFFER_MB
    };

    let available = memory_mb as f64
        - OS_RESERVE_MB
        - (sort_buffer_mb * n_mappers as u64) as f64
        - CO_LOCATED_ROLE_RESERVE_MB * co_located_role_count as f64;
    let per_slot = (available / (n_mappers + n_reducers) as f64).floor();
    let child_heap_mb = if per_slot > MIN_HEAP_MB as f64 {
        per_slot as u64
    } else {
        MIN_HEAP_MB
    };

    ResourceProfile {
        max_map_tasks: n_mappers,
        max_reduce_tasks: n_reducers,
        child_heap_mb,
        child_ulimit_kb: child_heap_mb.saturating_mul(3 * 1024),
        sort_buffer_mb,
        sort_factor: SORT_FACTOR,
        sort_record_percent: SORT_RECORD_PERCENT,
        node_manager_memory_mb: (memory_mb as f64 * 0.8) as u64,
        app_master_memory_mb: MIN_APP_MASTER_MB.max((memory_mb as f64 * 0.3) as u64),
    }
}

/// Profile for a node from its resource snapshot and hosted roles.
pub fn profile_for(node: &Node) -> ResourceProfile {
    compute_profile(
        node.resources.cores,
        node.resources.memory_mb(),
        node.co_located_heavy_roles(),
    )
}
