//! Memory graph snapshot loading
//!
//! The agent exports its entity graph as two JSON files: a nodes file keyed
//! by node id and an edges array. This module loads a read-only snapshot of
//! that pair for offline inspection. No layout or rendering here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Entity node from the nodes export.
///
/// The `type` vocabulary is open (character, location, object, event,
/// concept, organization, and whatever later agents invent); unknown kinds
/// pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_mention_count")]
    pub mention_count: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl GraphNode {
    /// Visual size the graph panel assigns this node
    pub fn display_weight(&self) -> u64 {
        self.mention_count.saturating_mul(2).max(3)
    }
}

/// Typed relationship from the edges export.
///
/// The relationship vocabulary is open (located_in, owns, member_of, ...).
/// Older exports omit `weight`, newer ones omit `evidence`; both default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default)]
    pub relationship: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub evidence: String,
    #[serde(default = "default_edge_weight")]
    pub weight: f64,
}

fn default_mention_count() -> u64 {
    1
}

fn default_confidence() -> f64 {
    1.0
}

fn default_edge_weight() -> f64 {
    1.0
}

/// Parsed graph export pair
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    nodes: HashMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
    dangling_edges: usize,
}

impl GraphSnapshot {
    /// Load a snapshot from the exported nodes and edges files.
    ///
    /// Edges whose endpoints are missing from the node map are counted and
    /// logged but kept; exports taken mid-write do dangle occasionally.
    pub fn load(nodes_path: &Path, edges_path: &Path) -> Result<Self> {
        let nodes_raw = std::fs::read_to_string(nodes_path)?;
        let keyed: HashMap<String, GraphNode> = serde_json::from_str(&nodes_raw)?;
        // Re-key by the embedded id; the map key is only a convenience copy.
        let nodes: HashMap<String, GraphNode> = keyed
            .into_values()
            .map(|node| (node.id.clone(), node))
            .collect();

        let edges_raw = std::fs::read_to_string(edges_path)?;
        let edges: Vec<GraphEdge> = serde_json::from_str(&edges_raw)?;

        let dangling_edges = edges
            .iter()
            .filter(|e| !nodes.contains_key(&e.from_node_id) || !nodes.contains_key(&e.to_node_id))
            .count();
        if dangling_edges > 0 {
            tracing::warn!(
                dangling_edges,
                "Graph export references nodes missing from the node map"
            );
        }
        tracing::debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            "Graph snapshot loaded"
        );

        Ok(Self {
            nodes,
            edges,
            dangling_edges,
        })
    }

    pub fn node_by_id(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges with at least one endpoint absent from the node map
    pub fn dangling_edges(&self) -> usize {
        self.dangling_edges
    }

    /// Distinct nodes connected to `id` by any edge, in id order
    pub fn neighbors(&self, id: &str) -> Vec<&GraphNode> {
        let mut ids = BTreeSet::new();
        for edge in &self.edges {
            if edge.from_node_id == id {
                ids.insert(edge.to_node_id.as_str());
            } else if edge.to_node_id == id {
                ids.insert(edge.from_node_id.as_str());
            }
        }
        ids.into_iter().filter_map(|id| self.nodes.get(id)).collect()
    }

    /// Edges touching `id` in either direction
    pub fn edges_for(&self, id: &str) -> Vec<&GraphEdge> {
        self.edges
            .iter()
            .filter(|e| e.from_node_id == id || e.to_node_id == id)
            .collect()
    }

    /// Node counts per entity type, sorted by type name
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.entity_type.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_export(dir: &tempfile::TempDir, nodes: &str, edges: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let nodes_path = dir.path().join("graph_nodes.json");
        let edges_path = dir.path().join("graph_edges.json");
        fs::write(&nodes_path, nodes).unwrap();
        fs::write(&edges_path, edges).unwrap();
        (nodes_path, edges_path)
    }

    const NODES: &str = r#"{
        "character_elena": {
            "id": "character_elena",
            "name": "Elena",
            "type": "character",
            "description": "Mayor of Haven",
            "aliases": ["the mayor"],
            "mention_count": 5,
            "created_at": "2025-01-01T00:00:00",
            "updated_at": "2025-01-02T00:00:00"
        },
        "location_haven": {
            "id": "location_haven",
            "name": "Haven",
            "type": "location",
            "description": "A fortified town",
            "aliases": [],
            "mention_count": 1
        },
        "artifact_lantern": {
            "id": "artifact_lantern",
            "name": "Storm Lantern",
            "type": "artifact",
            "description": "",
            "mention_count": 2
        }
    }"#;

    const EDGES: &str = r#"[
        {
            "from_node_id": "character_elena",
            "to_node_id": "location_haven",
            "relationship": "located_in",
            "confidence": 0.9,
            "evidence": "Elena addressed the crowd in Haven"
        },
        {
            "from_node_id": "character_elena",
            "to_node_id": "artifact_lantern",
            "relationship": "owns",
            "weight": 0.5
        }
    ]"#;

    #[test]
    fn test_load_and_lookups() {
        let dir = tempfile::TempDir::new().unwrap();
        let (nodes_path, edges_path) = write_export(&dir, NODES, EDGES);

        let snapshot = GraphSnapshot::load(&nodes_path, &edges_path).unwrap();
        assert_eq!(snapshot.node_count(), 3);
        assert_eq!(snapshot.edge_count(), 2);
        assert_eq!(snapshot.dangling_edges(), 0);

        let elena = snapshot.node_by_id("character_elena").unwrap();
        assert_eq!(elena.name, "Elena");
        assert_eq!(elena.entity_type, "character");
        assert_eq!(elena.aliases, vec!["the mayor"]);

        let neighbors = snapshot.neighbors("character_elena");
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].id, "artifact_lantern");
        assert_eq!(neighbors[1].id, "location_haven");

        let edges = snapshot.edges_for("location_haven");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relationship, "located_in");
        assert!((edges[0].confidence - 0.9).abs() < f64::EPSILON);
        // Omitted weight falls back to full strength.
        assert!((edges[0].weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counts_keep_unknown_entity_types() {
        let dir = tempfile::TempDir::new().unwrap();
        let (nodes_path, edges_path) = write_export(&dir, NODES, "[]");

        let snapshot = GraphSnapshot::load(&nodes_path, &edges_path).unwrap();
        let counts = snapshot.counts_by_type();
        assert_eq!(counts.get("character"), Some(&1));
        assert_eq!(counts.get("location"), Some(&1));
        assert_eq!(counts.get("artifact"), Some(&1));
    }

    #[test]
    fn test_display_weight_floor() {
        let dir = tempfile::TempDir::new().unwrap();
        let (nodes_path, edges_path) = write_export(&dir, NODES, "[]");

        let snapshot = GraphSnapshot::load(&nodes_path, &edges_path).unwrap();
        assert_eq!(snapshot.node_by_id("character_elena").unwrap().display_weight(), 10);
        // mention_count 1 stays at the minimum size of 3
        assert_eq!(snapshot.node_by_id("location_haven").unwrap().display_weight(), 3);
    }

    #[test]
    fn test_dangling_edges_counted_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let edges = r#"[
            {"from_node_id": "character_elena", "to_node_id": "location_ghost", "relationship": "located_in"},
            {"from_node_id": "character_elena", "to_node_id": "location_haven", "relationship": "located_in"}
        ]"#;
        let (nodes_path, edges_path) = write_export(&dir, NODES, edges);

        let snapshot = GraphSnapshot::load(&nodes_path, &edges_path).unwrap();
        assert_eq!(snapshot.edge_count(), 2);
        assert_eq!(snapshot.dangling_edges(), 1);
        // The dangling endpoint simply never resolves.
        assert_eq!(snapshot.neighbors("character_elena").len(), 1);
    }

    #[test]
    fn test_malformed_files_are_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let (nodes_path, edges_path) = write_export(&dir, "not json", "[]");
        assert!(GraphSnapshot::load(&nodes_path, &edges_path).is_err());

        let (nodes_path, edges_path) = write_export(&dir, "{}", r#"{"not": "an array"}"#);
        assert!(GraphSnapshot::load(&nodes_path, &edges_path).is_err());

        let missing = dir.path().join("absent.json");
        assert!(GraphSnapshot::load(&missing, &edges_path).is_err());
    }
}
