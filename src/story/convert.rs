//! Mapping between [`MetaGraphStoryData`] and the relational story schema.
//!
//! `convert_to_database` is strict about identity (every meta-graph node needs its
//! [`MetaNodeData`]) and tolerant about derived associations (meta-edges with unknown
//! endpoints are dropped). `convert_from_database` rebuilds every derived collection,
//! coercing stored JSON properties to string maps on the way out.

use super::model::{
    MetaGraphStoryData, NarrativeFlowEntry, NewCommunityStory, NewCommunitySummary, NewMetaEdge,
    NewMetaNode, NewStory, StoredMetaNode, StoredRelationship, StoredStory, StoryRows,
};
use crate::{
    community::CommunityMap,
    error::StoryError,
    graph::{GraphDocument, GraphNode, GraphRelationship},
    meta_graph::{
        detailed_internal_edges, ExternalConnection, InternalEdge, MetaGraphConfig, MetaNodeData,
        PreparedCommunity, PROP_EDGE_COUNT, PROP_EDGE_TYPES,
    },
    properties::coerce_properties,
};
use std::collections::{BTreeMap, BTreeSet};

pub fn convert_to_database(
    data: &MetaGraphStoryData,
    workspace_id: &str,
    topic_space_id: &str,
) -> Result<StoryRows, StoryError> {
    let meta_node_data: BTreeMap<&str, &MetaNodeData> = data
        .meta_nodes
        .iter()
        .map(|m| (m.community_id.as_str(), m))
        .collect();
    let narrative: BTreeMap<&str, &NarrativeFlowEntry> = data
        .narrative_flow
        .iter()
        .rev()
        .map(|entry| (entry.community_id.as_str(), entry))
        .collect();

    let mut community_ids: BTreeSet<&str> = BTreeSet::new();
    let mut meta_nodes = Vec::with_capacity(data.meta_graph.nodes.len());
    let mut summaries = Vec::new();
    for node in data.meta_graph.nodes.iter() {
        if !community_ids.insert(node.id.as_str()) {
            return Err(StoryError::invariant(format!(
                "community '{}' appears more than once in the meta-graph",
                node.id
            )));
        }
        let stats = meta_node_data.get(node.id.as_str()).ok_or_else(|| {
            StoryError::invariant(format!(
                "meta-graph node '{}' has no matching meta node data",
                node.id
            ))
        })?;
        meta_nodes.push(NewMetaNode {
            community_id: node.id.clone(),
            name: node.name.clone(),
            label: node.label.clone(),
            properties: node.properties.clone(),
            size: stats.size,
            has_external_connections: stats.has_external_connections,
            member_node_ids: stats.member_node_ids.clone(),
        });

        let placement = narrative.get(node.id.as_str());
        if stats.title.is_some() || stats.summary.is_some() || placement.is_some() {
            summaries.push(NewCommunitySummary {
                community_id: node.id.clone(),
                title: stats.title.clone(),
                summary: stats.summary.clone(),
                order: placement.map(|entry| entry.order),
                transition_text: placement.and_then(|entry| entry.transition_text.clone()),
            });
        }
    }

    let unplaced = narrative
        .keys()
        .filter(|id| !community_ids.contains(*id))
        .collect::<Vec<_>>();
    if !unplaced.is_empty() {
        tracing::warn!(
            "[convert_to_database] Narrative flow names unknown communities {:?}; ignoring them",
            unplaced
        );
    }

    let mut dropped = 0usize;
    let meta_edges = data
        .meta_graph
        .relationships
        .iter()
        .filter(|rel| {
            let valid = community_ids.contains(rel.source_id.as_str())
                && community_ids.contains(rel.target_id.as_str());
            if !valid {
                dropped += 1;
            }
            valid
        })
        .map(|rel| NewMetaEdge {
            edge_key: rel.id.clone(),
            from_community_id: rel.source_id.clone(),
            to_community_id: rel.target_id.clone(),
            kind: rel.kind.clone(),
            properties: rel.properties.clone(),
        })
        .collect::<Vec<_>>();
    if dropped > 0 {
        tracing::warn!(
            "[convert_to_database] Dropped {} meta-edges with dangling community endpoints",
            dropped
        );
    }

    let stories = data
        .detailed_stories
        .iter()
        .map(|(community_id, story)| NewCommunityStory {
            community_id: community_id.clone(),
            story: story.clone(),
        })
        .collect();

    Ok(StoryRows {
        story: NewStory {
            workspace_id: workspace_id.to_string(),
            referenced_topic_space_id: topic_space_id.to_string(),
            filter: data.filter.clone(),
        },
        meta_nodes,
        meta_edges,
        summaries,
        stories,
    })
}

fn member_nodes(meta_node: &StoredMetaNode) -> Vec<GraphNode> {
    meta_node
        .members
        .iter()
        .map(|m| GraphNode {
            id: m.id.clone(),
            name: m.name.clone(),
            label: m.label.clone(),
            properties: coerce_properties(&m.properties),
        })
        .collect()
}

/// Outgoing relationships of every member, in their original graph order.
fn member_relationships(meta_node: &StoredMetaNode) -> Vec<GraphRelationship> {
    let mut stored: Vec<&StoredRelationship> = meta_node
        .members
        .iter()
        .flat_map(|m| m.outgoing.iter())
        .collect();
    stored.sort_by_key(|r| r.position);
    stored
        .into_iter()
        .map(|r| GraphRelationship {
            id: r.id.clone(),
            kind: r.kind.clone(),
            properties: coerce_properties(&r.properties),
            source_id: r.source_id.clone(),
            target_id: r.target_id.clone(),
        })
        .collect()
}

/// Underlying types of a meta-edge. Edges stored without an `edgeTypes` property fall back to
/// splitting the joined `type` label.
fn stored_edge_types(rel: &GraphRelationship) -> Vec<String> {
    if let Some(types) = rel
        .properties
        .get(PROP_EDGE_TYPES)
        .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
    {
        return types;
    }
    rel.kind
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn convert_from_database(
    stored: &StoredStory,
    config: &MetaGraphConfig,
) -> Result<MetaGraphStoryData, StoryError> {
    let row_to_community: BTreeMap<&str, &str> = stored
        .meta_nodes
        .iter()
        .map(|m| (m.id.as_str(), m.community_id.as_str()))
        .collect();

    let mut meta_graph = GraphDocument::default();
    for meta_node in stored.meta_nodes.iter() {
        meta_graph.nodes.push(GraphNode {
            id: meta_node.community_id.clone(),
            name: meta_node.name.clone(),
            label: meta_node.label.clone(),
            properties: coerce_properties(&meta_node.properties),
        });
    }
    for (n, edge) in stored.meta_edges.iter().enumerate() {
        let (Some(from), Some(to)) = (
            row_to_community.get(edge.from_meta_node_id.as_str()),
            row_to_community.get(edge.to_meta_node_id.as_str()),
        ) else {
            tracing::warn!(
                "[convert_from_database] Meta-edge {} references a meta node outside story {}",
                edge.id,
                stored.story.id
            );
            continue;
        };
        meta_graph.relationships.push(GraphRelationship {
            id: edge
                .edge_key
                .clone()
                .unwrap_or_else(|| format!("{}{n}", crate::meta_graph::META_EDGE_PREFIX)),
            kind: edge.kind.clone(),
            properties: coerce_properties(&edge.properties),
            source_id: from.to_string(),
            target_id: to.to_string(),
        });
    }

    let mut meta_nodes = Vec::with_capacity(stored.meta_nodes.len());
    let mut prepared_communities = Vec::with_capacity(stored.meta_nodes.len());
    let mut community_map = CommunityMap::new();
    let mut placed: Vec<NarrativeFlowEntry> = Vec::new();
    let mut detailed_stories = BTreeMap::new();

    for meta_node in stored.meta_nodes.iter() {
        let community_id = meta_node.community_id.as_str();
        let members = member_nodes(meta_node);
        let member_refs: Vec<&GraphNode> = members.iter().collect();
        let detailed = detailed_internal_edges(&member_refs, member_relationships(meta_node).iter());

        let external_connections = meta_graph
            .relationships
            .iter()
            .filter_map(|rel| {
                let other = if rel.source_id == community_id {
                    &rel.target_id
                } else if rel.target_id == community_id {
                    &rel.source_id
                } else {
                    return None;
                };
                Some(ExternalConnection {
                    target_community_id: other.clone(),
                    edge_count: rel
                        .properties
                        .get(PROP_EDGE_COUNT)
                        .and_then(|c| c.parse().ok())
                        .unwrap_or(0),
                    edge_types: stored_edge_types(rel),
                })
            })
            .collect::<Vec<_>>();

        if meta_node.size as usize != members.len() {
            tracing::debug!(
                "[convert_from_database] Community {} stored size {} but has {} members",
                community_id,
                meta_node.size,
                members.len()
            );
        }

        let summary = meta_node.summary.clone().unwrap_or_default();
        if let Some(order) = summary.order {
            placed.push(NarrativeFlowEntry {
                community_id: community_id.to_string(),
                order,
                transition_text: summary.transition_text.clone(),
            });
        }
        if let Some(story) = meta_node.story.as_ref() {
            detailed_stories.insert(community_id.to_string(), story.clone());
        }
        for member in members.iter() {
            community_map.insert(member.id.clone(), community_id.to_string());
        }

        let member_node_names: Vec<String> = members.iter().map(|m| m.name.clone()).collect();
        prepared_communities.push(PreparedCommunity {
            community_id: community_id.to_string(),
            title: summary.title.clone(),
            summary: summary.summary.clone(),
            size: members.len(),
            member_node_names: member_node_names.clone(),
            internal_edges_detailed: detailed.clone(),
            external_connections: external_connections.clone(),
        });
        meta_nodes.push(MetaNodeData {
            community_id: community_id.to_string(),
            member_node_ids: members.iter().map(|m| m.id.clone()).collect(),
            member_node_names,
            size: members.len(),
            title: summary.title,
            summary: summary.summary,
            internal_edges: detailed
                .iter()
                .take(config.internal_edge_cap)
                .map(InternalEdge::from)
                .collect(),
            has_external_connections: !external_connections.is_empty(),
            external_connections,
        });
    }
    placed.sort_by_key(|entry| entry.order);

    Ok(MetaGraphStoryData {
        meta_graph,
        meta_nodes,
        community_map,
        narrative_flow: placed,
        detailed_stories,
        prepared_communities,
        filter: stored.story.filter.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        properties::properties_to_json,
        story::model::{StoredMember, StoredMetaEdge, StoredSummary, StoryContent, StoryRecord},
        meta_graph::MetaGraphBuilder,
        pipeline::story_from_build,
        tests::helpers::{community_map, node, rel, scenario_graph, scenario_story},
    };
    use chrono::Utc;
    use serde_json::{json, Value};

    /// Stand-in for the store: lay the rows out the way the database would return them.
    fn persist(rows: &StoryRows, graph: &GraphDocument) -> StoredStory {
        let now = Utc::now();
        let row_id = |community_id: &str| format!("row-{community_id}");
        let meta_nodes = rows
            .meta_nodes
            .iter()
            .map(|m| StoredMetaNode {
                id: row_id(&m.community_id),
                community_id: m.community_id.clone(),
                name: m.name.clone(),
                label: m.label.clone(),
                properties: properties_to_json(&m.properties),
                size: m.size as i64,
                has_external_connections: m.has_external_connections,
                members: m
                    .member_node_ids
                    .iter()
                    .map(|id| {
                        let node = graph.node(id).unwrap();
                        StoredMember {
                            id: node.id.clone(),
                            name: node.name.clone(),
                            label: node.label.clone(),
                            properties: properties_to_json(&node.properties),
                            outgoing: graph
                                .relationships
                                .iter()
                                .enumerate()
                                .filter(|(_, r)| r.source_id == node.id)
                                .map(|(position, r)| StoredRelationship {
                                    position: position as i64,
                                    id: r.id.clone(),
                                    kind: r.kind.clone(),
                                    properties: properties_to_json(&r.properties),
                                    source_id: r.source_id.clone(),
                                    target_id: r.target_id.clone(),
                                })
                                .collect(),
                        }
                    })
                    .collect(),
                summary: rows
                    .summaries
                    .iter()
                    .find(|s| s.community_id == m.community_id)
                    .map(|s| StoredSummary {
                        title: s.title.clone(),
                        summary: s.summary.clone(),
                        order: s.order,
                        transition_text: s.transition_text.clone(),
                    }),
                story: rows
                    .stories
                    .iter()
                    .find(|s| s.community_id == m.community_id)
                    .map(|s| s.story.clone()),
            })
            .collect();
        let meta_edges = rows
            .meta_edges
            .iter()
            .enumerate()
            .map(|(n, e)| StoredMetaEdge {
                id: format!("edge-row-{n}"),
                edge_key: Some(e.edge_key.clone()),
                from_meta_node_id: row_id(&e.from_community_id),
                to_meta_node_id: row_id(&e.to_community_id),
                kind: e.kind.clone(),
                properties: properties_to_json(&e.properties),
            })
            .collect();
        StoredStory {
            story: StoryRecord {
                id: "story-1".into(),
                workspace_id: rows.story.workspace_id.clone(),
                referenced_topic_space_id: rows.story.referenced_topic_space_id.clone(),
                filter: rows.story.filter.clone(),
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
            meta_nodes,
            meta_edges,
        }
    }

    #[test]
    fn round_trip_reproduces_story() {
        let mut data = scenario_story();
        data.filter = Some(json!({"layoutMode": "narrative", "generationMode": "auto"}));
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let restored =
            convert_from_database(&persist(&rows, &scenario_graph()), &MetaGraphConfig::default())
                .unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn missing_meta_node_data_is_an_invariant_violation() {
        let mut data = scenario_story();
        data.meta_nodes.retain(|m| m.community_id != "1");
        let err = convert_to_database(&data, "ws-1", "ts-1").unwrap_err();
        assert!(matches!(err, StoryError::Invariant(_)), "{err:?}");
    }

    #[test]
    fn dangling_meta_edges_are_filtered() {
        let mut data = scenario_story();
        let mut dangling = data.meta_graph.relationships[0].clone();
        dangling.id = "meta-edge-9".into();
        dangling.target_id = "ghost".into();
        data.meta_graph.relationships.push(dangling);

        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        assert_eq!(rows.meta_edges.len(), 1);
        assert_eq!(rows.meta_edges[0].edge_key, "meta-edge-0");
    }

    #[test]
    fn narrative_placement_is_joined_by_community() {
        let mut data = scenario_story();
        data.narrative_flow.retain(|e| e.community_id == "1");
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();

        let first = rows.summaries.iter().find(|s| s.community_id == "0").unwrap();
        assert_eq!(first.order, None);
        assert_eq!(first.transition_text, None);
        assert_eq!(first.title.as_deref(), Some("Origins"));
        let second = rows.summaries.iter().find(|s| s.community_id == "1").unwrap();
        assert_eq!(second.order, Some(1));
    }

    #[test]
    fn detailed_stories_pass_through_verbatim() {
        let mut data = scenario_story();
        let doc: StoryContent = serde_json::from_value(json!({
            "type": "doc",
            "content": [{"type": "paragraph", "attrs": {"segmentNodeIds": ["A"]}}]
        }))
        .unwrap();
        data.detailed_stories.insert("0".into(), doc.clone());
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let story = rows.stories.iter().find(|s| s.community_id == "0").unwrap();
        assert_eq!(story.story, doc);
    }

    #[test]
    fn narrative_flow_is_rebuilt_in_order() {
        let mut data = scenario_story();
        data.narrative_flow = vec![
            NarrativeFlowEntry {
                community_id: "1".into(),
                order: 0,
                transition_text: None,
            },
            NarrativeFlowEntry {
                community_id: "0".into(),
                order: 5,
                transition_text: Some("Back to the start".into()),
            },
        ];
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let restored =
            convert_from_database(&persist(&rows, &scenario_graph()), &MetaGraphConfig::default())
                .unwrap();
        let order: Vec<(&str, i64)> = restored
            .narrative_flow
            .iter()
            .map(|e| (e.community_id.as_str(), e.order))
            .collect();
        assert_eq!(order, vec![("1", 0), ("0", 5)]);
    }

    #[test]
    fn stored_properties_are_coerced_to_strings() {
        let data = scenario_story();
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let mut stored = persist(&rows, &scenario_graph());
        stored.meta_nodes[0].properties = json!({"size": 2, "pinned": true, "note": Value::Null});
        let restored = convert_from_database(&stored, &MetaGraphConfig::default()).unwrap();
        let props = &restored.meta_graph.nodes[0].properties;
        assert_eq!(props["size"], "2");
        assert_eq!(props["pinned"], "true");
        assert_eq!(props["note"], "");
    }

    #[test]
    fn community_map_is_rebuilt_from_members() {
        let data = scenario_story();
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let restored =
            convert_from_database(&persist(&rows, &scenario_graph()), &MetaGraphConfig::default())
                .unwrap();
        assert_eq!(restored.community_map.len(), 4);
        assert_eq!(restored.community_map["A"], "0");
        assert_eq!(restored.community_map["D"], "1");
    }

    #[test]
    fn edge_types_containing_commas_survive_storage() {
        let graph = GraphDocument::new(
            vec![node("A"), node("B")],
            vec![
                rel("r1", "A", "B", "WORKS_AT, PART_TIME"),
                rel("r2", "B", "A", "CITES"),
            ],
        );
        let map = community_map(&[("A", "x"), ("B", "y")]);
        let data = story_from_build(MetaGraphBuilder::new(&graph, &map).build(), &graph);

        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let restored =
            convert_from_database(&persist(&rows, &graph), &MetaGraphConfig::default()).unwrap();
        let x = restored.meta_nodes.iter().find(|m| m.community_id == "x").unwrap();
        assert_eq!(
            x.external_connections[0].edge_types,
            vec!["WORKS_AT, PART_TIME".to_string(), "CITES".to_string()]
        );
        assert_eq!(restored, data);
    }

    #[test]
    fn labels_without_stored_types_are_split() {
        let data = scenario_story();
        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let mut stored = persist(&rows, &scenario_graph());
        stored.meta_edges[0].kind = "R2,R3".into();
        stored.meta_edges[0].properties = json!({"edgeCount": 2});
        let restored = convert_from_database(&stored, &MetaGraphConfig::default()).unwrap();
        let first = restored.meta_nodes.iter().find(|m| m.community_id == "0").unwrap();
        assert_eq!(first.external_connections[0].edge_types, vec!["R2", "R3"]);
        assert_eq!(first.external_connections[0].edge_count, 2);
    }

    #[test]
    fn dense_community_is_capped_the_same_way_on_read() {
        // K8 gives 28 internal edges, over the default cap of 20
        let ids: Vec<String> = (0..8).map(|i| format!("k{i}")).collect();
        let mut nodes: Vec<GraphNode> = ids.iter().map(|id| node(id)).collect();
        nodes.push(node("lone"));
        let mut relationships = Vec::new();
        for i in 0..8 {
            for j in (i + 1)..8 {
                relationships.push(rel(&format!("k{i}{j}"), &ids[i], &ids[j], "KNOWS"));
            }
        }
        relationships.push(rel("out", "k7", "lone", "VISITS"));
        let graph = GraphDocument::new(nodes, relationships);
        let mut pairs: Vec<(&str, &str)> = ids.iter().map(|id| (id.as_str(), "dense")).collect();
        pairs.push(("lone", "sparse"));
        let map = community_map(&pairs);
        let data = story_from_build(MetaGraphBuilder::new(&graph, &map).build(), &graph);

        let dense = data.meta_nodes.iter().find(|m| m.community_id == "dense").unwrap();
        assert_eq!(dense.internal_edges.len(), 20);
        assert_eq!(dense.internal_edges[19].source_name, "k3");
        assert_eq!(dense.internal_edges[19].target_name, "k5");

        let rows = convert_to_database(&data, "ws-1", "ts-1").unwrap();
        let restored =
            convert_from_database(&persist(&rows, &graph), &MetaGraphConfig::default()).unwrap();
        assert_eq!(restored, data);
        let prepared = restored
            .prepared_communities
            .iter()
            .find(|p| p.community_id == "dense")
            .unwrap();
        assert_eq!(prepared.internal_edges_detailed.len(), 28);
    }
}
