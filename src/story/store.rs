//! Transactional story persistence.
//!
//! Every save is a full replace inside one transaction: snapshot the current state into
//! `story_history`, upsert the `story` row, drop its derived rows and write them again from
//! the incoming [`MetaGraphStoryData`]. Dropping the transaction on any error rolls the whole
//! save back.

use super::{
    consistency::{check_consistency, StoryConsistency},
    convert::{convert_from_database, convert_to_database},
    model::{
        MetaGraphStoryData, StoredMember, StoredMetaEdge, StoredMetaNode, StoredRelationship,
        StoredStory, StoredSummary, StoryContent, StoryHistoryEntry, StoryRecord, StoryRows,
    },
};
use crate::{
    db::{load_workspace, DbConnection, SQLITE_LIMIT_VARIABLE_NUMBER},
    error::StoryError,
    meta_graph::MetaGraphConfig,
    properties::properties_to_json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{
    sqlite::{Sqlite, SqliteConnection, SqliteRow},
    FromRow, QueryBuilder, Row,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What a read of a workspace's story returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryView {
    pub story: StoryRecord,
    pub meta_graph_data: MetaGraphStoryData,
    pub consistency: StoryConsistency,
}

#[derive(Debug, Clone)]
pub struct StoryStore {
    db: DbConnection,
    config: MetaGraphConfig,
}

fn json_column(raw: Option<&str>) -> Result<Option<Value>, StoryError> {
    raw.map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(StoryError::from)
}

impl FromRow<'_, SqliteRow> for StoryRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let filter: Option<&str> = row.try_get("filter")?;
        Ok(StoryRecord {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            referenced_topic_space_id: row.try_get("referenced_topic_space_id")?,
            filter: json_column(filter)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for StoryHistoryEntry {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(StoryHistoryEntry {
            id: row.try_get("id")?,
            story_id: row.try_get("story_id")?,
            saved_by_id: row.try_get("saved_by_id")?,
            created_at: row.try_get("created_at")?,
            description: row.try_get("description")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for StoredRelationship {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let properties: Option<&str> = row.try_get("properties")?;
        Ok(StoredRelationship {
            position: row.try_get("position")?,
            id: row.try_get("id")?,
            kind: row.try_get("type")?,
            properties: json_column(properties)?.unwrap_or(Value::Null),
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
        })
    }
}

impl FromRow<'_, SqliteRow> for StoredMetaEdge {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let properties: Option<&str> = row.try_get("properties")?;
        Ok(StoredMetaEdge {
            id: row.try_get("id")?,
            edge_key: row.try_get("edge_key")?,
            from_meta_node_id: row.try_get("from_meta_node_id")?,
            to_meta_node_id: row.try_get("to_meta_node_id")?,
            kind: row.try_get("type")?,
            properties: json_column(properties)?.unwrap_or(Value::Null),
        })
    }
}

/// Load a workspace's story with every relation [`convert_from_database`] needs.
async fn load_stored_story(
    conn: &mut SqliteConnection,
    workspace_id: &str,
    include_deleted: bool,
) -> Result<Option<StoredStory>, StoryError> {
    let sql = if include_deleted {
        "SELECT * FROM story WHERE workspace_id = ?"
    } else {
        "SELECT * FROM story WHERE workspace_id = ? AND deleted_at IS NULL"
    };
    let Some(story) = sqlx::query_as::<_, StoryRecord>(sql)
        .bind(workspace_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let mut outgoing: BTreeMap<String, Vec<StoredRelationship>> = BTreeMap::new();
    for rel in sqlx::query_as::<_, StoredRelationship>(
        "SELECT r.* FROM graph_relationship r WHERE r.source_id IN ( \
            SELECT m.graph_node_id FROM meta_graph_node_member m \
            JOIN meta_graph_node n ON n.id = m.meta_node_id WHERE n.story_id = ?) \
         ORDER BY r.position",
    )
    .bind(&story.id)
    .fetch_all(&mut *conn)
    .await?
    {
        outgoing.entry(rel.source_id.clone()).or_default().push(rel);
    }

    let mut members: BTreeMap<String, Vec<StoredMember>> = BTreeMap::new();
    for row in sqlx::query(
        "SELECT m.meta_node_id, g.id, g.name, g.label, g.properties \
         FROM meta_graph_node_member m \
         JOIN meta_graph_node n ON n.id = m.meta_node_id \
         JOIN graph_node g ON g.id = m.graph_node_id \
         WHERE n.story_id = ? ORDER BY m.meta_node_id, m.position",
    )
    .bind(&story.id)
    .fetch_all(&mut *conn)
    .await?
    {
        let meta_node_id: String = row.try_get("meta_node_id")?;
        let id: String = row.try_get("id")?;
        let properties: Option<&str> = row.try_get("properties")?;
        members.entry(meta_node_id).or_default().push(StoredMember {
            outgoing: outgoing.get(&id).cloned().unwrap_or_default(),
            id,
            name: row.try_get("name")?,
            label: row.try_get("label")?,
            properties: json_column(properties)?.unwrap_or(Value::Null),
        });
    }

    let mut meta_nodes = Vec::new();
    for row in sqlx::query(
        "SELECT n.id, n.community_id, n.name, n.label, n.properties, n.size, \
            n.has_external_connections, s.id AS summary_id, s.title, s.summary, \
            s.narrative_order, s.transition_text, c.story \
         FROM meta_graph_node n \
         LEFT JOIN community_summary s ON s.meta_node_id = n.id \
         LEFT JOIN community_story c ON c.meta_node_id = n.id \
         WHERE n.story_id = ? ORDER BY n.position",
    )
    .bind(&story.id)
    .fetch_all(&mut *conn)
    .await?
    {
        let id: String = row.try_get("id")?;
        let properties: Option<&str> = row.try_get("properties")?;
        let summary_id: Option<String> = row.try_get("summary_id")?;
        let summary = match summary_id {
            Some(_) => Some(StoredSummary {
                title: row.try_get("title")?,
                summary: row.try_get("summary")?,
                order: row.try_get("narrative_order")?,
                transition_text: row.try_get("transition_text")?,
            }),
            None => None,
        };
        let story_text: Option<&str> = row.try_get("story")?;
        let story_content = story_text
            .map(serde_json::from_str::<StoryContent>)
            .transpose()?;
        meta_nodes.push(StoredMetaNode {
            members: members.remove(&id).unwrap_or_default(),
            id,
            community_id: row.try_get("community_id")?,
            name: row.try_get("name")?,
            label: row.try_get("label")?,
            properties: json_column(properties)?.unwrap_or(Value::Null),
            size: row.try_get("size")?,
            has_external_connections: row.try_get("has_external_connections")?,
            summary,
            story: story_content,
        });
    }

    let meta_edges = sqlx::query_as::<_, StoredMetaEdge>(
        "SELECT * FROM meta_graph_relationship WHERE story_id = ? ORDER BY position",
    )
    .bind(&story.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(Some(StoredStory {
        story,
        meta_nodes,
        meta_edges,
    }))
}

/// Remove every row derived from a story, children first.
async fn delete_derived_rows(conn: &mut SqliteConnection, story_id: &str) -> Result<(), StoryError> {
    let statements = [
        "DELETE FROM meta_graph_relationship WHERE story_id = ?",
        "DELETE FROM community_story WHERE meta_node_id IN \
            (SELECT id FROM meta_graph_node WHERE story_id = ?)",
        "DELETE FROM community_summary WHERE meta_node_id IN \
            (SELECT id FROM meta_graph_node WHERE story_id = ?)",
        "DELETE FROM meta_graph_node_member WHERE meta_node_id IN \
            (SELECT id FROM meta_graph_node WHERE story_id = ?)",
        "DELETE FROM meta_graph_node WHERE story_id = ?",
    ];
    for sql in statements {
        sqlx::query(sql).bind(story_id).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Write the derived rows for `story_id`, resolving community ids to the new row ids.
async fn insert_derived_rows(
    conn: &mut SqliteConnection,
    story_id: &str,
    rows: &StoryRows,
) -> Result<(), StoryError> {
    let mut row_ids: BTreeMap<&str, String> = BTreeMap::new();
    for (position, meta_node) in rows.meta_nodes.iter().enumerate() {
        let row_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO meta_graph_node (id, story_id, community_id, name, label, properties, \
                size, has_external_connections, position) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row_id)
        .bind(story_id)
        .bind(&meta_node.community_id)
        .bind(&meta_node.name)
        .bind(&meta_node.label)
        .bind(properties_to_json(&meta_node.properties).to_string())
        .bind(meta_node.size as i64)
        .bind(meta_node.has_external_connections)
        .bind(position as i64)
        .execute(&mut *conn)
        .await?;

        let indexed = meta_node.member_node_ids.iter().enumerate().collect::<Vec<_>>();
        for chunk in indexed.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 3) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO meta_graph_node_member (meta_node_id, graph_node_id, position) ",
            );
            qb.push_values(chunk.iter(), |mut b, (member_position, node_id)| {
                b.push_bind(row_id.clone())
                    .push_bind(node_id.to_string())
                    .push_bind(*member_position as i64);
            });
            qb.build().execute(&mut *conn).await.map_err(|e| {
                tracing::error!(
                    "[StoryStore.insert_derived_rows] Failed to attach members to community {}: {}",
                    meta_node.community_id,
                    e
                );
                e
            })?;
        }
        row_ids.insert(meta_node.community_id.as_str(), row_id);
    }

    let resolve = |community_id: &str, what: &str| {
        row_ids.get(community_id).cloned().ok_or_else(|| {
            StoryError::invariant(format!(
                "{what} references community '{community_id}' which has no meta-graph node"
            ))
        })
    };

    for (position, edge) in rows.meta_edges.iter().enumerate() {
        let from = resolve(&edge.from_community_id, "meta-edge")?;
        let to = resolve(&edge.to_community_id, "meta-edge")?;
        sqlx::query(
            "INSERT INTO meta_graph_relationship (id, story_id, edge_key, from_meta_node_id, \
                to_meta_node_id, type, properties, position) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(story_id)
        .bind(&edge.edge_key)
        .bind(from)
        .bind(to)
        .bind(&edge.kind)
        .bind(properties_to_json(&edge.properties).to_string())
        .bind(position as i64)
        .execute(&mut *conn)
        .await?;
    }

    for summary in rows.summaries.iter() {
        let meta_node_id = resolve(&summary.community_id, "community summary")?;
        sqlx::query(
            "INSERT INTO community_summary (id, meta_node_id, title, summary, narrative_order, \
                transition_text) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(meta_node_id)
        .bind(&summary.title)
        .bind(&summary.summary)
        .bind(summary.order)
        .bind(&summary.transition_text)
        .execute(&mut *conn)
        .await?;
    }

    for story in rows.stories.iter() {
        let meta_node_id = resolve(&story.community_id, "community story")?;
        sqlx::query("INSERT INTO community_story (id, meta_node_id, story) VALUES (?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(meta_node_id)
            .bind(serde_json::to_string(&story.story)?)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

impl StoryStore {
    pub fn new(db: DbConnection, config: MetaGraphConfig) -> Self {
        StoryStore { db, config }
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    /// Save `data` as the workspace's story, replacing whatever was there.
    ///
    /// The previous state (soft-deleted or not) is appended to the history first. Saving over a
    /// soft-deleted story restores it.
    #[tracing::instrument(skip(self, data), fields(communities = data.meta_nodes.len()))]
    pub async fn upsert_story(
        &self,
        workspace_id: &str,
        topic_space_id: &str,
        data: &MetaGraphStoryData,
        actor_id: &str,
        description: Option<&str>,
    ) -> Result<StoryRecord, StoryError> {
        let rows = convert_to_database(data, workspace_id, topic_space_id)?;
        let mut tx = self.db.0.begin().await?;

        if load_workspace(&mut tx, workspace_id).await?.is_none() {
            return Err(StoryError::NotFound(format!("workspace {workspace_id}")));
        }

        let existing = load_stored_story(&mut tx, workspace_id, true).await?;
        let now = Utc::now();

        let story_id = match existing {
            Some(ref stored) => {
                let snapshot = convert_from_database(stored, &self.config)?;
                sqlx::query(
                    "INSERT INTO story_history (id, story_id, snapshot_data, saved_by_id, \
                        created_at, description) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&stored.story.id)
                .bind(serde_json::to_string(&snapshot)?)
                .bind(actor_id)
                .bind(now)
                .bind(description)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE story SET referenced_topic_space_id = ?, filter = ?, updated_at = ?, \
                        deleted_at = NULL, updated_by_id = ? WHERE id = ?",
                )
                .bind(&rows.story.referenced_topic_space_id)
                .bind(rows.story.filter.as_ref().map(Value::to_string))
                .bind(now)
                .bind(actor_id)
                .bind(&stored.story.id)
                .execute(&mut *tx)
                .await?;

                delete_derived_rows(&mut tx, &stored.story.id).await?;
                stored.story.id.clone()
            }
            None => {
                let story_id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO story (id, workspace_id, referenced_topic_space_id, filter, \
                        created_at, updated_at, deleted_at, updated_by_id) \
                     VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
                )
                .bind(&story_id)
                .bind(&rows.story.workspace_id)
                .bind(&rows.story.referenced_topic_space_id)
                .bind(rows.story.filter.as_ref().map(Value::to_string))
                .bind(now)
                .bind(now)
                .bind(actor_id)
                .execute(&mut *tx)
                .await?;
                story_id
            }
        };

        insert_derived_rows(&mut tx, &story_id, &rows)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[StoryStore.upsert] Rolling back save for workspace {}: {}",
                    workspace_id,
                    e
                );
                e
            })?;

        let record = sqlx::query_as::<_, StoryRecord>("SELECT * FROM story WHERE id = ?")
            .bind(&story_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "[StoryStore.upsert] Saved story {} for workspace {} ({} communities, {} meta-edges)",
            record.id,
            workspace_id,
            rows.meta_nodes.len(),
            rows.meta_edges.len()
        );
        Ok(record)
    }

    /// The workspace's live story, reconstructed, with its topic-space consistency.
    pub async fn get_story(&self, workspace_id: &str) -> Result<Option<StoryView>, StoryError> {
        let mut conn = self.db.0.acquire().await?;
        let Some(stored) = load_stored_story(&mut conn, workspace_id, false).await? else {
            return Ok(None);
        };
        let topic_spaces = load_workspace(&mut conn, workspace_id)
            .await?
            .map(|w| w.referenced_topic_space_ids)
            .unwrap_or_default();
        let consistency = check_consistency(
            &topic_spaces,
            Some(stored.story.referenced_topic_space_id.as_str()),
        );
        let meta_graph_data = convert_from_database(&stored, &self.config)?;
        Ok(Some(StoryView {
            story: stored.story,
            meta_graph_data,
            consistency,
        }))
    }

    pub async fn workspace_consistency(
        &self,
        workspace_id: &str,
    ) -> Result<StoryConsistency, StoryError> {
        let mut conn = self.db.0.acquire().await?;
        let workspace = load_workspace(&mut conn, workspace_id)
            .await?
            .ok_or_else(|| StoryError::NotFound(format!("workspace {workspace_id}")))?;
        let story_topic_space: Option<String> = sqlx::query_scalar(
            "SELECT referenced_topic_space_id FROM story \
             WHERE workspace_id = ? AND deleted_at IS NULL",
        )
        .bind(workspace_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(check_consistency(
            &workspace.referenced_topic_space_ids,
            story_topic_space.as_deref(),
        ))
    }

    /// Mark the workspace's story deleted. Only the owner or a collaborator may do this.
    #[tracing::instrument(skip(self))]
    pub async fn soft_delete_story(
        &self,
        workspace_id: &str,
        actor_id: &str,
    ) -> Result<StoryRecord, StoryError> {
        let mut tx = self.db.0.begin().await?;
        let allowed = load_workspace(&mut tx, workspace_id)
            .await?
            .is_some_and(|w| w.can_edit(actor_id));
        if !allowed {
            tracing::warn!(
                "[StoryStore.soft_delete] {} may not delete the story of workspace {}",
                actor_id,
                workspace_id
            );
            return Err(StoryError::PermissionDenied);
        }

        let now: DateTime<Utc> = Utc::now();
        let record = sqlx::query_as::<_, StoryRecord>(
            "UPDATE story SET deleted_at = ?, updated_at = ?, updated_by_id = ? \
             WHERE workspace_id = ? AND deleted_at IS NULL RETURNING *",
        )
        .bind(now)
        .bind(now)
        .bind(actor_id)
        .bind(workspace_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoryError::NotFound(format!("story for workspace {workspace_id}")))?;
        tx.commit().await?;
        Ok(record)
    }

    /// History rows for the workspace's story, newest first.
    pub async fn story_history(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<StoryHistoryEntry>, StoryError> {
        let entries = sqlx::query_as::<_, StoryHistoryEntry>(
            "SELECT h.id, h.story_id, h.saved_by_id, h.created_at, h.description \
             FROM story_history h JOIN story s ON s.id = h.story_id \
             WHERE s.workspace_id = ? ORDER BY h.created_at DESC, h.rowid DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.db.0)
        .await?;
        Ok(entries)
    }

    pub async fn history_snapshot(
        &self,
        history_id: &str,
    ) -> Result<MetaGraphStoryData, StoryError> {
        let raw: String =
            sqlx::query_scalar("SELECT snapshot_data FROM story_history WHERE id = ?")
                .bind(history_id)
                .fetch_optional(&self.db.0)
                .await?
                .ok_or_else(|| StoryError::NotFound(format!("story history {history_id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }
}
