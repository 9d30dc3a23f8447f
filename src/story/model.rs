//! In-memory story shape and the relational row shapes it maps to.

use crate::{
    community::CommunityMap,
    graph::GraphDocument,
    meta_graph::{MetaNodeData, PreparedCommunity},
    properties::Properties,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeFlowEntry {
    pub community_id: String,
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_text: Option<String>,
}

/// Detailed narrative for one community: plain text or a rich-text document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoryContent {
    Text(String),
    Document(RichTextDocument),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichTextDocument {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Vec<RichTextNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RichTextNode {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<RichTextNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Value>,
}

pub const SEGMENT_NODE_IDS_ATTR: &str = "segmentNodeIds";
pub const SEGMENT_EDGE_IDS_ATTR: &str = "segmentEdgeIds";

/// Graph elements a story's narrative segments point back to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentLinks {
    pub node_ids: BTreeSet<String>,
    pub edge_ids: BTreeSet<String>,
}

impl RichTextDocument {
    pub fn segment_links(&self) -> SegmentLinks {
        let mut links = SegmentLinks::default();
        let mut stack: Vec<&RichTextNode> = self.content.iter().collect();
        while let Some(node) = stack.pop() {
            collect_ids(node.attrs.get(SEGMENT_NODE_IDS_ATTR), &mut links.node_ids);
            collect_ids(node.attrs.get(SEGMENT_EDGE_IDS_ATTR), &mut links.edge_ids);
            stack.extend(node.content.iter());
        }
        links
    }
}

// Attributes arrive either as JSON arrays or as comma-separated strings.
fn collect_ids(value: Option<&Value>, into: &mut BTreeSet<String>) {
    match value {
        Some(Value::Array(items)) => into.extend(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        ),
        Some(Value::String(joined)) => into.extend(
            joined
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        ),
        _ => {}
    }
}

impl StoryContent {
    pub fn segment_links(&self) -> SegmentLinks {
        match self {
            StoryContent::Text(_) => SegmentLinks::default(),
            StoryContent::Document(doc) => doc.segment_links(),
        }
    }
}

/// The full meta-graph story as consumed by rendering, export and regeneration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaGraphStoryData {
    pub meta_graph: GraphDocument,
    pub meta_nodes: Vec<MetaNodeData>,
    #[serde(default)]
    pub community_map: CommunityMap,
    #[serde(default)]
    pub narrative_flow: Vec<NarrativeFlowEntry>,
    #[serde(default)]
    pub detailed_stories: BTreeMap<String, StoryContent>,
    #[serde(default)]
    pub prepared_communities: Vec<PreparedCommunity>,
    /// Serialized layout / generation-mode options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

// ---- rows produced by `convert_to_database` ----

#[derive(Debug, Clone, PartialEq)]
pub struct NewStory {
    pub workspace_id: String,
    pub referenced_topic_space_id: String,
    pub filter: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMetaNode {
    pub community_id: String,
    pub name: String,
    pub label: String,
    pub properties: Properties,
    pub size: usize,
    pub has_external_connections: bool,
    pub member_node_ids: Vec<String>,
}

/// Endpoints are community ids; the store resolves them to row ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMetaEdge {
    pub edge_key: String,
    pub from_community_id: String,
    pub to_community_id: String,
    pub kind: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommunitySummary {
    pub community_id: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub order: Option<i64>,
    pub transition_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommunityStory {
    pub community_id: String,
    pub story: StoryContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoryRows {
    pub story: NewStory,
    pub meta_nodes: Vec<NewMetaNode>,
    pub meta_edges: Vec<NewMetaEdge>,
    pub summaries: Vec<NewCommunitySummary>,
    pub stories: Vec<NewCommunityStory>,
}

// ---- rows read back for `convert_from_database` ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRecord {
    pub id: String,
    pub workspace_id: String,
    pub referenced_topic_space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRelationship {
    pub position: i64,
    pub id: String,
    pub kind: String,
    pub properties: Value,
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMember {
    pub id: String,
    pub name: String,
    pub label: String,
    pub properties: Value,
    pub outgoing: Vec<StoredRelationship>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredSummary {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub order: Option<i64>,
    pub transition_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMetaNode {
    pub id: String,
    pub community_id: String,
    pub name: String,
    pub label: String,
    pub properties: Value,
    pub size: i64,
    pub has_external_connections: bool,
    pub members: Vec<StoredMember>,
    pub summary: Option<StoredSummary>,
    pub story: Option<StoryContent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMetaEdge {
    pub id: String,
    pub edge_key: Option<String>,
    pub from_meta_node_id: String,
    pub to_meta_node_id: String,
    pub kind: String,
    pub properties: Value,
}

/// A story row with every relation needed to rebuild [`MetaGraphStoryData`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStory {
    pub story: StoryRecord,
    pub meta_nodes: Vec<StoredMetaNode>,
    pub meta_edges: Vec<StoredMetaEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryHistoryEntry {
    pub id: String,
    pub story_id: String,
    pub saved_by_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn story_content_accepts_text_or_document() {
        let text: StoryContent = serde_json::from_value(json!("Once upon a time")).unwrap();
        assert_eq!(text, StoryContent::Text("Once upon a time".into()));

        let doc: StoryContent = serde_json::from_value(json!({
            "type": "doc",
            "content": [
                {
                    "type": "paragraph",
                    "attrs": {"segmentNodeIds": ["n1", "n2"], "segmentEdgeIds": "e1, e2"},
                    "content": [{"type": "text", "text": "A met B."}]
                },
                {
                    "type": "paragraph",
                    "attrs": {"segmentNodeIds": ["n2", "n3"]},
                    "content": [{"type": "text", "text": "Then C."}]
                }
            ]
        }))
        .unwrap();
        let links = doc.segment_links();
        assert_eq!(
            links.node_ids.into_iter().collect::<Vec<_>>(),
            vec!["n1", "n2", "n3"]
        );
        assert_eq!(
            links.edge_ids.into_iter().collect::<Vec<_>>(),
            vec!["e1", "e2"]
        );
    }

    #[test]
    fn rich_text_survives_json_encoding() {
        let raw = json!({
            "type": "doc",
            "content": [{"type": "paragraph", "content": [{"type": "text", "text": "x", "marks": [{"type": "bold"}]}]}]
        });
        let doc: StoryContent = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&doc).unwrap(), raw);
    }
}
