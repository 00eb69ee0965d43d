//! Topology classification
//!
//! Derives the layout of a role from how its holders are spread over facets:
//! a lone instance, one HA pair, independent federated instances, or a mix.
//!
//! Classification is a pure function of the multiset of facet sizes. It is
//! recomputed from a fresh snapshot on every call; two calls in the same run
//! can disagree if membership changes between them, and nothing corrects for
//! that.

use crate::cluster::{NetworkPlane, Node, PlaneProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Cluster shape for one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Zero or one instance
    Single,
    /// Every instance sits in one facet
    HaPair,
    /// Every instance is its own facet
    Federation,
    /// Several facets, at least one of them replicated
    HaFederation,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Single => "single",
            Topology::HaPair => "ha_pair",
            Topology::Federation => "federation",
            Topology::HaFederation => "ha_federation",
        }
    }

    /// More than one instance, so nameservice keys must be rendered.
    pub fn is_multi_instance(&self) -> bool {
        !matches!(self, Topology::Single)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify from facet sizes.
///
/// Rules apply in order, first match wins:
/// 1. N <= 1 is `Single`
/// 2. every facet has one instance (F == N) is `Federation`
/// 3. a single replicated facet (F == 1) is `HaPair`
/// 4. anything else is `HaFederation`, including one replicated facet next
///    to singletons: each facet is its own nameservice and one of them is HA
pub fn classify_facet_sizes(sizes: &[usize]) -> Topology {
    let total: usize = sizes.iter().sum();
    let facets = sizes.iter().filter(|s| **s > 0).count();

    if total <= 1 {
        Topology::Single
    } else if facets == total {
        Topology::Federation
    } else if facets == 1 {
        Topology::HaPair
    } else {
        Topology::HaFederation
    }
}

/// Holders of one role grouped by facet, ordered by facet name.
///
/// Built from a single directory snapshot so that every derived value agrees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacetLayout {
    facets: BTreeMap<String, Vec<Node>>,
}

impl FacetLayout {
    pub fn from_nodes(nodes: &[Node]) -> Self {
        let mut facets: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            facets
                .entry(node.facet_name.clone())
                .or_default()
                .push(node.clone());
        }
        for members in facets.values_mut() {
            members.sort_by(|a, b| (a.facet_index, &a.address).cmp(&(b.facet_index, &b.address)));
        }
        Self { facets }
    }

    pub fn classify(&self) -> Topology {
        let sizes: Vec<usize> = self.facets.values().map(Vec::len).collect();
        classify_facet_sizes(&sizes)
    }

    pub fn instance_count(&self) -> usize {
        self.facets.values().map(Vec::len).sum()
    }

    pub fn facet_count(&self) -> usize {
        self.facets.len()
    }

    /// Sorted distinct facet names
    pub fn facet_names(&self) -> Vec<String> {
        self.facets.keys().cloned().collect()
    }

    /// facet name -> sorted plane addresses of its members
    pub fn facet_addresses(
        &self,
        planes: &dyn PlaneProvider,
        plane: NetworkPlane,
    ) -> BTreeMap<String, Vec<String>> {
        self.facets
            .iter()
            .map(|(name, members)| {
                let mut addresses: Vec<String> =
                    members.iter().map(|n| planes.address(n, plane)).collect();
                addresses.sort();
                addresses.dedup();
                (name.clone(), addresses)
            })
            .collect()
    }

    pub fn members(&self, facet: &str) -> &[Node] {
        self.facets.get(facet).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Facet-index-0 member of a facet
    pub fn primary_of(&self, facet: &str) -> Option<&Node> {
        self.members(facet).iter().find(|n| n.is_facet_primary())
    }

    /// The facet runs more than one instance of the role
    pub fn is_replicated(&self, facet: &str) -> bool {
        self.members(facet).len() > 1
    }
}
