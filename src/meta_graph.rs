//! Meta-graph aggregation: one node per community, one edge per connected community pair.
//!
//! Relationships are partitioned into **internal** (both endpoints in the same community) and
//! **external** (different communities). External relationships between two communities are
//! collapsed regardless of direction into a single bundle keyed by the lexicographically smaller
//! of `"A-B"` / `"B-A"`. All aggregation uses insertion-ordered structures, so meta-edge ids are
//! stable across repeated runs on the same input.

use crate::{
    community::CommunityMap,
    graph::{GraphDocument, GraphNode, GraphRelationship},
    properties::Properties,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const UNASSIGNED_COMMUNITY: &str = "unassigned";
pub const META_NODE_LABEL: &str = "Community";
pub const META_EDGE_PREFIX: &str = "meta-edge-";

pub const PROP_SIZE: &str = "size";
pub const PROP_MEMBER_COUNT: &str = "memberCount";
pub const PROP_SAMPLE_MEMBERS: &str = "sampleMembers";
pub const PROP_INTERNAL_EDGE_COUNT: &str = "internalEdgeCount";
pub const PROP_EDGE_COUNT: &str = "edgeCount";
pub const PROP_WEIGHT: &str = "weight";
/// JSON array of the distinct underlying types; `type` joins the same list with `,`.
pub const PROP_EDGE_TYPES: &str = "edgeTypes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaGraphConfig {
    /// Internal edges kept per community for display and summarization.
    pub internal_edge_cap: usize,
    /// Member names sampled into each meta-graph node's properties.
    pub sample_member_count: usize,
}

impl Default for MetaGraphConfig {
    fn default() -> Self {
        MetaGraphConfig {
            internal_edge_cap: 20,
            sample_member_count: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalEdge {
    pub source_name: String,
    pub target_name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalConnection {
    pub target_community_id: String,
    pub edge_count: usize,
    pub edge_types: Vec<String>,
}

/// Aggregate statistics for one community.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaNodeData {
    pub community_id: String,
    pub member_node_ids: Vec<String>,
    pub member_node_names: Vec<String>,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub internal_edges: Vec<InternalEdge>,
    #[serde(default)]
    pub external_connections: Vec<ExternalConnection>,
    pub has_external_connections: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedEdge {
    pub source_id: String,
    pub source_name: String,
    pub target_id: String,
    pub target_name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&DetailedEdge> for InternalEdge {
    fn from(edge: &DetailedEdge) -> Self {
        InternalEdge {
            source_name: edge.source_name.clone(),
            target_name: edge.target_name.clone(),
            kind: edge.kind.clone(),
        }
    }
}

/// Community projection handed to narrative regeneration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedCommunity {
    pub community_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub size: usize,
    pub member_node_names: Vec<String>,
    pub internal_edges_detailed: Vec<DetailedEdge>,
    pub external_connections: Vec<ExternalConnection>,
}

/// Title and summary text produced for one community by the summarization collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryText {
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaGraphBuild {
    pub meta_nodes: Vec<MetaNodeData>,
    pub meta_graph: GraphDocument,
    pub community_map: CommunityMap,
}

/// Relationships whose endpoints are both members, in the order they are given.
///
/// Shared by the in-memory and database paths so both agree on what counts as internal.
pub fn detailed_internal_edges<'a, I>(members: &[&GraphNode], relationships: I) -> Vec<DetailedEdge>
where
    I: IntoIterator<Item = &'a GraphRelationship>,
{
    let names: BTreeMap<&str, &str> = members
        .iter()
        .map(|n| (n.id.as_str(), n.name.as_str()))
        .collect();
    relationships
        .into_iter()
        .filter_map(|rel| {
            let source_name = names.get(rel.source_id.as_str())?;
            let target_name = names.get(rel.target_id.as_str())?;
            Some(DetailedEdge {
                source_id: rel.source_id.clone(),
                source_name: source_name.to_string(),
                target_id: rel.target_id.clone(),
                target_name: target_name.to_string(),
                kind: rel.kind.clone(),
            })
        })
        .collect()
}

pub fn meta_node_name(community_id: &str, title: Option<&str>) -> String {
    match title {
        Some(title) if !title.is_empty() => title.to_string(),
        _ => format!("Community {community_id}"),
    }
}

/// Key for an unordered community pair: the smaller of `"a-b"` and `"b-a"`.
pub fn pair_key(a: &str, b: &str) -> String {
    let forward = format!("{a}-{b}");
    let reverse = format!("{b}-{a}");
    if forward <= reverse {
        forward
    } else {
        reverse
    }
}

struct PairAggregate {
    source: usize,
    target: usize,
    count: usize,
    types: Vec<String>,
}

pub struct MetaGraphBuilder<'a> {
    graph: &'a GraphDocument,
    community_map: &'a CommunityMap,
    titles: BTreeMap<String, String>,
    config: MetaGraphConfig,
}

impl<'a> MetaGraphBuilder<'a> {
    pub fn new(graph: &'a GraphDocument, community_map: &'a CommunityMap) -> Self {
        MetaGraphBuilder {
            graph,
            community_map,
            titles: BTreeMap::new(),
            config: MetaGraphConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MetaGraphConfig) -> Self {
        self.config = config;
        self
    }

    /// Titles already known for some communities (e.g. from a previous narrative pass).
    pub fn with_titles(mut self, titles: BTreeMap<String, String>) -> Self {
        self.titles = titles;
        self
    }

    pub fn build(self) -> MetaGraphBuild {
        let mut communities: Vec<String> = Vec::new();
        let mut community_index: BTreeMap<String, usize> = BTreeMap::new();
        let mut members: Vec<Vec<&GraphNode>> = Vec::new();
        let mut node_community: BTreeMap<&str, usize> = BTreeMap::new();
        let mut assignment = CommunityMap::new();

        for node in self.graph.nodes.iter() {
            let community_id = self
                .community_map
                .get(&node.id)
                .map(String::as_str)
                .unwrap_or(UNASSIGNED_COMMUNITY);
            let idx = match community_index.get(community_id) {
                Some(idx) => *idx,
                None => {
                    communities.push(community_id.to_string());
                    members.push(Vec::new());
                    community_index.insert(community_id.to_string(), communities.len() - 1);
                    communities.len() - 1
                }
            };
            members[idx].push(node);
            node_community.insert(node.id.as_str(), idx);
            assignment.insert(node.id.clone(), community_id.to_string());
        }

        let mut internal_edges: Vec<Vec<InternalEdge>> = vec![Vec::new(); communities.len()];
        let mut internal_counts: Vec<usize> = vec![0; communities.len()];
        let mut pairs: Vec<PairAggregate> = Vec::new();
        let mut pair_index: BTreeMap<(usize, usize), usize> = BTreeMap::new();
        let names = self.graph.names();

        for rel in self.graph.relationships.iter() {
            let (Some(&source), Some(&target)) = (
                node_community.get(rel.source_id.as_str()),
                node_community.get(rel.target_id.as_str()),
            ) else {
                tracing::warn!(
                    "[MetaGraphBuilder] Skipping relationship {} ({} -> {}): endpoint has no community",
                    rel.id,
                    rel.source_id,
                    rel.target_id
                );
                continue;
            };

            if source == target {
                internal_counts[source] += 1;
                if internal_edges[source].len() < self.config.internal_edge_cap {
                    internal_edges[source].push(InternalEdge {
                        source_name: names[rel.source_id.as_str()].to_string(),
                        target_name: names[rel.target_id.as_str()].to_string(),
                        kind: rel.kind.clone(),
                    });
                }
                continue;
            }

            // ids may contain '-', so two pairs can share a key string
            let slot = (source.min(target), source.max(target));
            let idx = match pair_index.get(&slot) {
                Some(idx) => *idx,
                None => {
                    let key = pair_key(&communities[source], &communities[target]);
                    let (first, second) =
                        if key == format!("{}-{}", communities[source], communities[target]) {
                            (source, target)
                        } else {
                            (target, source)
                        };
                    pairs.push(PairAggregate {
                        source: first,
                        target: second,
                        count: 0,
                        types: Vec::new(),
                    });
                    pair_index.insert(slot, pairs.len() - 1);
                    pairs.len() - 1
                }
            };
            let pair = &mut pairs[idx];
            pair.count += 1;
            if !pair.types.contains(&rel.kind) {
                pair.types.push(rel.kind.clone());
            }
        }

        let mut meta_nodes = Vec::with_capacity(communities.len());
        let mut meta_graph = GraphDocument::default();
        for (idx, community_id) in communities.iter().enumerate() {
            let external_connections = pairs
                .iter()
                .filter_map(|pair| {
                    let other = if pair.source == idx {
                        pair.target
                    } else if pair.target == idx {
                        pair.source
                    } else {
                        return None;
                    };
                    Some(ExternalConnection {
                        target_community_id: communities[other].clone(),
                        edge_count: pair.count,
                        edge_types: pair.types.clone(),
                    })
                })
                .collect::<Vec<_>>();
            let title = self.titles.get(community_id).cloned();
            let member_node_names: Vec<String> =
                members[idx].iter().map(|n| n.name.clone()).collect();

            let mut properties = Properties::new();
            properties.insert(PROP_SIZE.to_string(), members[idx].len().to_string());
            properties.insert(PROP_MEMBER_COUNT.to_string(), members[idx].len().to_string());
            properties.insert(
                PROP_SAMPLE_MEMBERS.to_string(),
                member_node_names
                    .iter()
                    .take(self.config.sample_member_count)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            properties.insert(
                PROP_INTERNAL_EDGE_COUNT.to_string(),
                internal_counts[idx].to_string(),
            );
            meta_graph.nodes.push(GraphNode {
                id: community_id.clone(),
                name: meta_node_name(community_id, title.as_deref()),
                label: META_NODE_LABEL.to_string(),
                properties,
            });

            meta_nodes.push(MetaNodeData {
                community_id: community_id.clone(),
                member_node_ids: members[idx].iter().map(|n| n.id.clone()).collect(),
                member_node_names,
                size: members[idx].len(),
                title,
                summary: None,
                internal_edges: std::mem::take(&mut internal_edges[idx]),
                has_external_connections: !external_connections.is_empty(),
                external_connections,
            });
        }

        for (n, pair) in pairs.iter().enumerate() {
            let mut properties = Properties::new();
            properties.insert(PROP_EDGE_COUNT.to_string(), pair.count.to_string());
            properties.insert(PROP_WEIGHT.to_string(), pair.count.to_string());
            properties.insert(
                PROP_EDGE_TYPES.to_string(),
                serde_json::to_string(&pair.types).unwrap_or_default(),
            );
            meta_graph.relationships.push(GraphRelationship {
                id: format!("{META_EDGE_PREFIX}{n}"),
                kind: pair.types.join(","),
                properties,
                source_id: communities[pair.source].clone(),
                target_id: communities[pair.target].clone(),
            });
        }

        tracing::debug!(
            "[MetaGraphBuilder] {} communities, {} meta-edges from {} nodes / {} relationships",
            meta_nodes.len(),
            meta_graph.relationships.len(),
            self.graph.nodes.len(),
            self.graph.relationships.len()
        );

        MetaGraphBuild {
            meta_nodes,
            meta_graph,
            community_map: assignment,
        }
    }
}

impl MetaGraphBuild {
    pub fn meta_node(&self, community_id: &str) -> Option<&MetaNodeData> {
        self.meta_nodes
            .iter()
            .find(|n| n.community_id == community_id)
    }

    /// Attach generated titles and summaries; renamed meta-graph nodes pick up the new title.
    pub fn apply_summaries(&mut self, summaries: &BTreeMap<String, SummaryText>) {
        for meta_node in self.meta_nodes.iter_mut() {
            if let Some(text) = summaries.get(&meta_node.community_id) {
                meta_node.title = Some(text.title.clone());
                meta_node.summary = Some(text.summary.clone());
            }
        }
        for node in self.meta_graph.nodes.iter_mut() {
            if let Some(text) = summaries.get(&node.id) {
                node.name = meta_node_name(&node.id, Some(&text.title));
            }
        }
        let unknown: BTreeSet<&String> = summaries
            .keys()
            .filter(|id| self.meta_node(id).is_none())
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(
                "[MetaGraphBuild.apply_summaries] Ignoring summaries for unknown communities: {:?}",
                unknown
            );
        }
    }

    pub fn prepare_communities(&self, graph: &GraphDocument) -> Vec<PreparedCommunity> {
        prepare_communities(graph, &self.meta_nodes)
    }
}

pub fn prepare_communities(graph: &GraphDocument, meta_nodes: &[MetaNodeData]) -> Vec<PreparedCommunity> {
    let by_id: BTreeMap<&str, &GraphNode> =
        graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    meta_nodes
        .iter()
        .map(|meta_node| {
            let members: Vec<&GraphNode> = meta_node
                .member_node_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            PreparedCommunity {
                community_id: meta_node.community_id.clone(),
                title: meta_node.title.clone(),
                summary: meta_node.summary.clone(),
                size: meta_node.size,
                member_node_names: meta_node.member_node_names.clone(),
                internal_edges_detailed: detailed_internal_edges(&members, graph.relationships.iter()),
                external_connections: meta_node.external_connections.clone(),
            }
        })
        .collect()
}
