//! Shared test utilities for graph, meta-graph and story conversion tests

use crate::{
    community::CommunityMap,
    graph::{GraphDocument, GraphNode, GraphRelationship},
    meta_graph::{MetaGraphBuilder, SummaryText},
    story::{MetaGraphStoryData, NarrativeFlowEntry, StoryContent},
};
use std::collections::BTreeMap;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn node(id: &str) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        name: id.to_string(),
        label: "Entity".to_string(),
        ..Default::default()
    }
}

pub fn rel(id: &str, source: &str, target: &str, kind: &str) -> GraphRelationship {
    GraphRelationship {
        id: id.to_string(),
        kind: kind.to_string(),
        source_id: source.to_string(),
        target_id: target.to_string(),
        ..Default::default()
    }
}

pub fn community_map(pairs: &[(&str, &str)]) -> CommunityMap {
    pairs
        .iter()
        .map(|(node, community)| (node.to_string(), community.to_string()))
        .collect()
}

/// Nodes A, B, C, D with A->B (R1), C->D (R1) and the bridge B->C (R2).
pub fn scenario_graph() -> GraphDocument {
    GraphDocument::new(
        vec![node("A"), node("B"), node("C"), node("D")],
        vec![
            rel("r1", "A", "B", "R1"),
            rel("r2", "C", "D", "R1"),
            rel("r3", "B", "C", "R2"),
        ],
    )
}

/// Two 4-cliques (a1..a4, b1..b4) joined by a single a4 - b1 bridge.
pub fn two_cliques() -> GraphDocument {
    let mut nodes = Vec::new();
    let mut rels = Vec::new();
    for side in ["a", "b"] {
        for i in 1..=4 {
            nodes.push(node(&format!("{side}{i}")));
        }
        for i in 1..=4 {
            for j in (i + 1)..=4 {
                rels.push(rel(
                    &format!("{side}{i}{j}"),
                    &format!("{side}{i}"),
                    &format!("{side}{j}"),
                    "RELATED_TO",
                ));
            }
        }
    }
    rels.push(rel("bridge", "a4", "b1", "BRIDGES"));
    GraphDocument::new(nodes, rels)
}

/// Story data for [`scenario_graph`] with both communities summarized, community "0" placed
/// first in the narrative and a detailed story for each.
pub fn scenario_story() -> MetaGraphStoryData {
    let graph = scenario_graph();
    let map = community_map(&[("A", "0"), ("B", "0"), ("C", "1"), ("D", "1")]);
    let mut build = MetaGraphBuilder::new(&graph, &map).build();
    build.apply_summaries(&BTreeMap::from([
        (
            "0".to_string(),
            SummaryText {
                title: "Origins".into(),
                summary: "How A met B.".into(),
            },
        ),
        (
            "1".to_string(),
            SummaryText {
                title: "Aftermath".into(),
                summary: "C and D.".into(),
            },
        ),
    ]));
    let prepared = build.prepare_communities(&graph);
    MetaGraphStoryData {
        meta_graph: build.meta_graph,
        meta_nodes: build.meta_nodes,
        community_map: build.community_map,
        narrative_flow: vec![
            NarrativeFlowEntry {
                community_id: "0".into(),
                order: 0,
                transition_text: Some("Which leads to".into()),
            },
            NarrativeFlowEntry {
                community_id: "1".into(),
                order: 1,
                transition_text: None,
            },
        ],
        detailed_stories: BTreeMap::from([
            ("0".to_string(), StoryContent::Text("A met B.".into())),
            ("1".to_string(), StoryContent::Text("C followed D.".into())),
        ]),
        prepared_communities: prepared,
        filter: None,
    }
}
