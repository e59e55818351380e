//! Compiled graph IR. Produced by `GraphCompiler`, consumed by runtimes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphIrNode {
    pub id: String,
    pub node_type: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphIrEdge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Back edge into a loop node from its own body.
    #[serde(default)]
    pub reentry: bool,
}

/// Handle-to-target routing for a branching node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingMap {
    pub edges: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_handle: Option<String>,
}

impl RoutingMap {
    /// Target for `handle`, falling back to the default handle.
    pub fn target(&self, handle: Option<&str>) -> Option<&str> {
        handle
            .and_then(|h| self.edges.get(h))
            .or_else(|| {
                self.default_handle
                    .as_deref()
                    .and_then(|h| self.edges.get(h))
            })
            .map(String::as_str)
    }
}

/// Where the branches of a parallel node meet again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barrier {
    pub join_node: String,
    pub branches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphIr {
    pub nodes: Vec<GraphIrNode>,
    pub edges: Vec<GraphIrEdge>,
    pub routing_maps: BTreeMap<String, RoutingMap>,
    pub entry_point: String,
    pub exit_nodes: BTreeSet<String>,
    /// Keyed by parallel node id.
    #[serde(default)]
    pub barriers: BTreeMap<String, Barrier>,
}

impl GraphIr {
    pub fn node(&self, id: &str) -> Option<&GraphIrNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphIrEdge> + 'a {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn routing(&self, id: &str) -> Option<&RoutingMap> {
        self.routing_maps.get(id)
    }

    pub fn is_exit(&self, id: &str) -> bool {
        self.exit_nodes.contains(id)
    }

    /// Arrivals `join_node` must collect before it runs, summed over the
    /// parallel nodes that re-join there.
    pub fn barrier_arrivals(&self, join_node: &str) -> usize {
        self.barriers
            .values()
            .filter(|b| b.join_node == join_node)
            .map(|b| b.branches)
            .sum()
    }

    /// True when `source -> target` is a loop re-entry edge.
    pub fn is_reentry(&self, source: &str, target: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.reentry && e.source == source && e.target == target)
    }
}
