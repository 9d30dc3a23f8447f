//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use arstraverse_core::graph::{GraphDocument, GraphNode, GraphRelationship};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[allow(dead_code)]
pub fn node(id: &str, name: &str) -> GraphNode {
    GraphNode {
        id: id.to_string(),
        name: name.to_string(),
        label: "Person".to_string(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn rel(id: &str, source: &str, target: &str, kind: &str) -> GraphRelationship {
    GraphRelationship {
        id: id.to_string(),
        kind: kind.to_string(),
        source_id: source.to_string(),
        target_id: target.to_string(),
        ..Default::default()
    }
}

/// Three tight groups of four, chained by single bridges: g0 - g1 - g2.
#[allow(dead_code)]
pub fn three_groups() -> GraphDocument {
    let mut nodes = Vec::new();
    let mut rels = Vec::new();
    for group in 0..3 {
        for i in 0..4 {
            let id = format!("g{group}n{i}");
            nodes.push(node(&id, &format!("Member {i} of group {group}")));
        }
        for i in 0..4 {
            for j in (i + 1)..4 {
                rels.push(rel(
                    &format!("g{group}r{i}{j}"),
                    &format!("g{group}n{i}"),
                    &format!("g{group}n{j}"),
                    "KNOWS",
                ));
            }
        }
    }
    rels.push(rel("bridge01", "g0n3", "g1n0", "MENTORS"));
    rels.push(rel("bridge12", "g2n0", "g1n3", "CITES"));
    GraphDocument::new(nodes, rels)
}
