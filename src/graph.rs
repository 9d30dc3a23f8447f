//! Raw knowledge-graph documents consumed by community detection.
//!
//! A [`GraphDocument`] is owned by the graph-storage collaborator; this crate only reads it.
//! [`UndirectedProjection`] is the structural view the detector runs on.

use crate::{error::StoryError, properties::Properties};
use petgraph::{
    graph::{NodeIndex, UnGraph},
    visit::EdgeRef,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRelationship {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Properties,
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub relationships: Vec<GraphRelationship>,
}

impl GraphDocument {
    pub fn new(nodes: Vec<GraphNode>, relationships: Vec<GraphRelationship>) -> Self {
        GraphDocument {
            nodes,
            relationships,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node id -> node name, for rendering edges by name.
    pub fn names(&self) -> BTreeMap<&str, &str> {
        self.nodes
            .iter()
            .map(|n| (n.id.as_str(), n.name.as_str()))
            .collect()
    }
}

/// Undirected, unweighted view of a [`GraphDocument`].
///
/// Node indices follow the document's node order. Parallel relationships between the same
/// pair of nodes (in either direction) collapse into a single edge of weight 1; the first
/// relationship wins. Self-loops and relationships with unknown endpoints are dropped.
#[derive(Debug, Clone)]
pub struct UndirectedProjection {
    graph: UnGraph<String, f64>,
}

impl UndirectedProjection {
    pub fn from_document(doc: &GraphDocument) -> Result<Self, StoryError> {
        let mut graph =
            UnGraph::<String, f64>::with_capacity(doc.nodes.len(), doc.relationships.len());
        let mut id_to_index: BTreeMap<&str, NodeIndex> = BTreeMap::new();
        for node in doc.nodes.iter() {
            if id_to_index.contains_key(node.id.as_str()) {
                return Err(StoryError::Detection(format!(
                    "duplicate node id '{}' in graph document",
                    node.id
                )));
            }
            let idx = graph.add_node(node.id.clone());
            id_to_index.insert(node.id.as_str(), idx);
        }

        let mut seen: BTreeSet<(NodeIndex, NodeIndex)> = BTreeSet::new();
        let mut skipped = 0usize;
        for rel in doc.relationships.iter() {
            let (Some(&a), Some(&b)) = (
                id_to_index.get(rel.source_id.as_str()),
                id_to_index.get(rel.target_id.as_str()),
            ) else {
                skipped += 1;
                continue;
            };
            if a == b {
                skipped += 1;
                continue;
            }
            let key = if a < b { (a, b) } else { (b, a) };
            if seen.insert(key) {
                graph.add_edge(a, b, 1.0);
            }
        }
        if skipped > 0 {
            tracing::debug!(
                "[UndirectedProjection] Ignored {} self-loop or dangling relationships",
                skipped
            );
        }
        Ok(UndirectedProjection { graph })
    }

    pub fn as_graph(&self) -> &UnGraph<String, f64> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_id(&self, idx: usize) -> &str {
        &self.graph[NodeIndex::new(idx)]
    }

    /// Per-node weighted adjacency lists, indexed like the document's nodes.
    pub fn adjacency(&self) -> Vec<Vec<(usize, f64)>> {
        let mut adj = vec![Vec::new(); self.graph.node_count()];
        for edge in self.graph.edge_references() {
            let (a, b) = (edge.source().index(), edge.target().index());
            adj[a].push((b, *edge.weight()));
            adj[b].push((a, *edge.weight()));
        }
        adj
    }
}
