//! # arstraverse-core
//!
//! Community detection, meta-graph synthesis and versioned story persistence for knowledge
//! graphs.
//!
//! ## Overview
//!
//! A knowledge graph (nodes plus typed, directed relationships) is partitioned into communities
//! with Louvain modularity optimization. Each community becomes one node of a **meta-graph**,
//! and every pair of communities joined by at least one relationship becomes one meta-edge.
//! On top of the meta-graph a **story** is assembled: an ordered narrative flow over the
//! communities, a title and summary for each, and a detailed narrative per community. Stories
//! are persisted one per workspace with an append-only snapshot history.
//!
//! ## Architecture
//!
//! - **[`graph`]**: `GraphDocument` and its undirected `petgraph` projection
//! - **[`community`]**: Louvain detection (`detect_communities`) and modularity scoring
//! - **[`meta_graph`]**: per-community aggregation (`MetaGraphBuilder`, `MetaNodeData`)
//! - **[`pipeline`]**: `generate_meta_graph`, which degrades to `None` instead of failing
//! - **[`story`]**: the `MetaGraphStoryData` shape, its relational mapping, the topic-space
//!   consistency check and the transactional `StoryStore`
//! - **[`db`]**: SQLite pool, migrations, graph and workspace tables
//! - **[`config`]**: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arstraverse_core::{config::StoryConfig, graph::GraphDocument, pipeline};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph: GraphDocument = serde_json::from_str(&std::fs::read_to_string("graph.json")?)?;
//! match pipeline::generate_meta_graph(Some(&graph), &StoryConfig::default()) {
//!     Some(build) => {
//!         for node in build.meta_graph.nodes.iter() {
//!             println!("{}: {} members", node.name, node.properties["memberCount"]);
//!         }
//!     }
//!     None => println!("no meta-graph for this graph"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **default**: `service`
//! - **service**: SQLite persistence (`sqlx`): [`db`] and [`story::store`]
//! - **bin**: the `arstraverse` command line tool

pub mod community;
pub mod config;
#[cfg(feature = "service")]
pub mod db;
pub mod error;
pub mod graph;
pub mod meta_graph;
pub mod pipeline;
pub mod properties;
pub mod story;
#[cfg(test)]
mod tests;

pub use error::*;
