//! Graph in, meta-graph out.
//!
//! This is the entry point used by callers that just want "the meta-graph for this topic-space".
//! An absent or empty graph and a failed detection both yield `None`; only failures to fetch
//! the graph itself are reported as errors.

use crate::{
    community::detect_communities,
    config::StoryConfig,
    error::StoryError,
    graph::GraphDocument,
    meta_graph::{MetaGraphBuild, MetaGraphBuilder},
    story::MetaGraphStoryData,
};
use std::{collections::BTreeMap, future::Future};

/// Read-only access to the raw knowledge graph of a topic-space.
pub trait GraphSource: Sync {
    /// `Ok(None)` when the topic-space has no graph.
    fn graph_document(
        &self,
        topic_space_id: &str,
    ) -> impl Future<Output = Result<Option<GraphDocument>, StoryError>> + Send;
}

impl GraphSource for BTreeMap<String, GraphDocument> {
    async fn graph_document(
        &self,
        topic_space_id: &str,
    ) -> Result<Option<GraphDocument>, StoryError> {
        Ok(self.get(topic_space_id).cloned())
    }
}

pub fn generate_meta_graph(
    graph: Option<&GraphDocument>,
    config: &StoryConfig,
) -> Option<MetaGraphBuild> {
    let graph = graph.filter(|g| !g.is_empty())?;
    let detection = match detect_communities(graph, &config.detection) {
        Ok(detection) => detection,
        Err(e) => {
            tracing::error!("[generate_meta_graph] Community detection failed: {}", e);
            return None;
        }
    };
    tracing::info!(
        "[generate_meta_graph] {} communities over {} nodes (modularity {:.4})",
        detection.community_count,
        graph.nodes.len(),
        detection.modularity
    );
    Some(
        MetaGraphBuilder::new(graph, &detection.assignment)
            .with_config(config.meta_graph.clone())
            .build(),
    )
}

pub async fn generate_for_topic_space<S: GraphSource>(
    source: &S,
    topic_space_id: &str,
    config: &StoryConfig,
) -> Result<Option<(GraphDocument, MetaGraphBuild)>, StoryError> {
    let Some(graph) = source.graph_document(topic_space_id).await? else {
        tracing::debug!(
            "[generate_for_topic_space] No graph stored for topic-space {}",
            topic_space_id
        );
        return Ok(None);
    };
    Ok(generate_meta_graph(Some(&graph), config).map(|build| (graph, build)))
}

/// A fresh story over `build`: no narrative placement and no detailed stories yet.
pub fn story_from_build(build: MetaGraphBuild, graph: &GraphDocument) -> MetaGraphStoryData {
    let prepared_communities = build.prepare_communities(graph);
    MetaGraphStoryData {
        meta_graph: build.meta_graph,
        meta_nodes: build.meta_nodes,
        community_map: build.community_map,
        prepared_communities,
        ..Default::default()
    }
}
