use crate::{
    error::StoryError,
    graph::{GraphDocument, GraphNode, GraphRelationship},
    pipeline::GraphSource,
    properties::{parse_properties, properties_to_json},
};
use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqliteRow},
    ConnectOptions, FromRow, Row,
};
use sqlx::{migrate::MigrationType, Pool, QueryBuilder};
use std::{path::PathBuf, result::Result, str::FromStr};

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

/// Workspace ownership and topic-space selection, as provided by the workspace collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub collaborator_ids: Vec<String>,
    #[serde(default)]
    pub referenced_topic_space_ids: Vec<String>,
}

impl WorkspaceRecord {
    pub fn can_edit(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.collaborator_ids.iter().any(|c| c == user_id)
    }
}

impl FromRow<'_, SqliteRow> for GraphNode {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let properties: Option<&str> = row.try_get("properties")?;
        Ok(GraphNode {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            label: row.try_get("label")?,
            properties: parse_properties(properties),
        })
    }
}

impl FromRow<'_, SqliteRow> for GraphRelationship {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let properties: Option<&str> = row.try_get("properties")?;
        Ok(GraphRelationship {
            id: row.try_get("id")?,
            kind: row.try_get("type")?,
            properties: parse_properties(properties),
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
        })
    }
}

impl DbConnection {
    /// Replace the stored graph for a topic-space.
    ///
    /// Nodes are updated in place so meta-graph memberships pointing at surviving nodes are
    /// kept; nodes missing from `graph` are removed along with their memberships.
    #[tracing::instrument(skip(self, graph), fields(nodes = graph.nodes.len()))]
    pub async fn put_graph(
        &self,
        topic_space_id: &str,
        graph: &GraphDocument,
    ) -> Result<(), StoryError> {
        let mut tx = self.0.begin().await?;

        sqlx::query("DELETE FROM graph_relationship WHERE topic_space_id = ?")
            .bind(topic_space_id)
            .execute(&mut *tx)
            .await?;

        // existing nodes are marked stale; the upsert below clears the mark on survivors
        sqlx::query("UPDATE graph_node SET position = -1 WHERE topic_space_id = ?")
            .bind(topic_space_id)
            .execute(&mut *tx)
            .await?;

        let indexed_nodes = graph.nodes.iter().enumerate().collect::<Vec<_>>();
        for chunk in indexed_nodes.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 6) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO graph_node (id, topic_space_id, name, label, properties, position) ",
            );
            qb.push_values(chunk.iter(), |mut b, (position, node)| {
                b.push_bind(node.id.clone())
                    .push_bind(topic_space_id.to_string())
                    .push_bind(node.name.clone())
                    .push_bind(node.label.clone())
                    .push_bind(properties_to_json(&node.properties).to_string())
                    .push_bind(*position as i64);
            });
            qb.push(
                " ON CONFLICT(id) DO UPDATE SET topic_space_id = excluded.topic_space_id, \
                 name = excluded.name, label = excluded.label, \
                 properties = excluded.properties, position = excluded.position",
            );
            qb.build().execute(&mut *tx).await.map_err(|e| {
                tracing::error!(
                    "[DbConnection.put_graph] Failed to write nodes for {}: {}",
                    topic_space_id,
                    e
                );
                e
            })?;
        }

        sqlx::query("DELETE FROM graph_node WHERE topic_space_id = ? AND position < 0")
            .bind(topic_space_id)
            .execute(&mut *tx)
            .await?;

        let indexed = graph.relationships.iter().enumerate().collect::<Vec<_>>();
        for chunk in indexed.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 7) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT OR REPLACE INTO graph_relationship \
                 (id, topic_space_id, type, properties, source_id, target_id, position) ",
            );
            qb.push_values(chunk.iter(), |mut b, (position, rel)| {
                b.push_bind(rel.id.clone())
                    .push_bind(topic_space_id.to_string())
                    .push_bind(rel.kind.clone())
                    .push_bind(properties_to_json(&rel.properties).to_string())
                    .push_bind(rel.source_id.clone())
                    .push_bind(rel.target_id.clone())
                    .push_bind(*position as i64);
            });
            qb.build().execute(&mut *tx).await.map_err(|e| {
                tracing::error!(
                    "[DbConnection.put_graph] Failed to write relationships for {}: {}",
                    topic_space_id,
                    e
                );
                e
            })?;
        }

        tx.commit().await?;
        tracing::info!(
            "[DbConnection.put_graph] Stored {} nodes / {} relationships for topic-space {}",
            graph.nodes.len(),
            graph.relationships.len(),
            topic_space_id
        );
        Ok(())
    }

    pub async fn graph(&self, topic_space_id: &str) -> Result<GraphDocument, StoryError> {
        let nodes = sqlx::query_as::<_, GraphNode>(
            "SELECT * FROM graph_node WHERE topic_space_id = ? ORDER BY position",
        )
        .bind(topic_space_id)
        .fetch_all(&self.0)
        .await?;
        let relationships = sqlx::query_as::<_, GraphRelationship>(
            "SELECT * FROM graph_relationship WHERE topic_space_id = ? ORDER BY position",
        )
        .bind(topic_space_id)
        .fetch_all(&self.0)
        .await?;
        Ok(GraphDocument::new(nodes, relationships))
    }

    pub async fn put_workspace(&self, workspace: &WorkspaceRecord) -> Result<(), StoryError> {
        let mut tx = self.0.begin().await?;
        sqlx::query(
            "INSERT INTO workspace (id, owner_id) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET owner_id = excluded.owner_id",
        )
        .bind(&workspace.id)
        .bind(&workspace.owner_id)
        .execute(&mut *tx)
        .await?;

        for table in ["workspace_collaborator", "workspace_topic_space"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE workspace_id = ?"))
                .bind(&workspace.id)
                .execute(&mut *tx)
                .await?;
        }
        for (position, user_id) in workspace.collaborator_ids.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO workspace_collaborator (workspace_id, user_id, position) \
                 VALUES (?, ?, ?)",
            )
            .bind(&workspace.id)
            .bind(user_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        for (position, topic_space_id) in workspace.referenced_topic_space_ids.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO workspace_topic_space \
                 (workspace_id, topic_space_id, position) VALUES (?, ?, ?)",
            )
            .bind(&workspace.id)
            .bind(topic_space_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn workspace(&self, workspace_id: &str) -> Result<Option<WorkspaceRecord>, StoryError> {
        let mut conn = self.0.acquire().await?;
        load_workspace(&mut conn, workspace_id).await
    }
}

pub(crate) async fn load_workspace(
    conn: &mut SqliteConnection,
    workspace_id: &str,
) -> Result<Option<WorkspaceRecord>, StoryError> {
    let Some(row) = sqlx::query("SELECT id, owner_id FROM workspace WHERE id = ?")
        .bind(workspace_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    let collaborator_ids = sqlx::query_scalar::<_, String>(
        "SELECT user_id FROM workspace_collaborator WHERE workspace_id = ? ORDER BY position",
    )
    .bind(workspace_id)
    .fetch_all(&mut *conn)
    .await?;
    let referenced_topic_space_ids = sqlx::query_scalar::<_, String>(
        "SELECT topic_space_id FROM workspace_topic_space WHERE workspace_id = ? ORDER BY position",
    )
    .bind(workspace_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(Some(WorkspaceRecord {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        collaborator_ids,
        referenced_topic_space_ids,
    }))
}

impl GraphSource for DbConnection {
    async fn graph_document(
        &self,
        topic_space_id: &str,
    ) -> Result<Option<GraphDocument>, StoryError> {
        let graph = self.graph(topic_space_id).await?;
        Ok((!graph.is_empty()).then_some(graph))
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![
        Migration {
            version: 1,
            description: "create_graph_and_workspace_tables",
            sql: "\
            CREATE TABLE graph_node (id TEXT PRIMARY KEY, topic_space_id TEXT NOT NULL, name TEXT NOT NULL, \
                label TEXT NOT NULL, properties TEXT, position INTEGER NOT NULL DEFAULT 0); \
            CREATE INDEX graph_node_topic_space ON graph_node(topic_space_id); \
            CREATE TABLE graph_relationship (id TEXT PRIMARY KEY, topic_space_id TEXT NOT NULL, type TEXT NOT NULL, \
                properties TEXT, \
                source_id TEXT NOT NULL REFERENCES graph_node(id) ON DELETE CASCADE, \
                target_id TEXT NOT NULL REFERENCES graph_node(id) ON DELETE CASCADE, \
                position INTEGER NOT NULL DEFAULT 0); \
            CREATE INDEX graph_relationship_source ON graph_relationship(source_id); \
            CREATE TABLE workspace (id TEXT PRIMARY KEY, owner_id TEXT NOT NULL); \
            CREATE TABLE workspace_collaborator (workspace_id TEXT NOT NULL REFERENCES workspace(id) ON DELETE CASCADE, \
                user_id TEXT NOT NULL, position INTEGER NOT NULL DEFAULT 0, UNIQUE(workspace_id, user_id)); \
            CREATE TABLE workspace_topic_space (workspace_id TEXT NOT NULL REFERENCES workspace(id) ON DELETE CASCADE, \
                topic_space_id TEXT NOT NULL, position INTEGER NOT NULL DEFAULT 0, UNIQUE(workspace_id, topic_space_id));",
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 2,
            description: "create_story_tables",
            sql: "\
            CREATE TABLE story (id TEXT PRIMARY KEY, \
                workspace_id TEXT NOT NULL UNIQUE REFERENCES workspace(id) ON DELETE CASCADE, \
                referenced_topic_space_id TEXT NOT NULL, filter TEXT, \
                created_at TEXT NOT NULL, updated_at TEXT NOT NULL, deleted_at TEXT, updated_by_id TEXT); \
            CREATE TABLE meta_graph_node (id TEXT PRIMARY KEY, \
                story_id TEXT NOT NULL REFERENCES story(id) ON DELETE CASCADE, \
                community_id TEXT NOT NULL, name TEXT NOT NULL, label TEXT NOT NULL, properties TEXT, \
                size INTEGER NOT NULL, has_external_connections INTEGER NOT NULL, position INTEGER NOT NULL, \
                UNIQUE(story_id, community_id)); \
            CREATE TABLE meta_graph_node_member ( \
                meta_node_id TEXT NOT NULL REFERENCES meta_graph_node(id) ON DELETE CASCADE, \
                graph_node_id TEXT NOT NULL REFERENCES graph_node(id) ON DELETE CASCADE, \
                position INTEGER NOT NULL, UNIQUE(meta_node_id, graph_node_id)); \
            CREATE TABLE meta_graph_relationship (id TEXT PRIMARY KEY, \
                story_id TEXT NOT NULL REFERENCES story(id) ON DELETE CASCADE, edge_key TEXT, \
                from_meta_node_id TEXT NOT NULL REFERENCES meta_graph_node(id), \
                to_meta_node_id TEXT NOT NULL REFERENCES meta_graph_node(id), \
                type TEXT NOT NULL, properties TEXT, position INTEGER NOT NULL); \
            CREATE TABLE community_summary (id TEXT PRIMARY KEY, \
                meta_node_id TEXT NOT NULL UNIQUE REFERENCES meta_graph_node(id), \
                title TEXT, summary TEXT, narrative_order INTEGER, transition_text TEXT); \
            CREATE TABLE community_story (id TEXT PRIMARY KEY, \
                meta_node_id TEXT NOT NULL UNIQUE REFERENCES meta_graph_node(id), story TEXT NOT NULL); \
            CREATE TABLE story_history (id TEXT PRIMARY KEY, \
                story_id TEXT NOT NULL REFERENCES story(id) ON DELETE CASCADE, \
                snapshot_data TEXT NOT NULL, saved_by_id TEXT NOT NULL, created_at TEXT NOT NULL, description TEXT); \
            CREATE INDEX story_history_story ON story_history(story_id);",
            kind: MigrationType::ReversibleUp,
        },
    ])
}

pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, StoryError> {
    let fqdb = format!("sqlite:{}", db_path.display());
    tracing::debug!("Initializing story db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .foreign_keys(true)
        .disable_statement_logging()
        .create_if_missing(true);

    let pool = PoolOptions::<Sqlite>::new()
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await.map_err(sqlx::Error::from)?;
    migrator.run(&pool).await.map_err(sqlx::Error::from)?;

    let node_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_node")
        .fetch_one(&pool)
        .await?;
    let story_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM story WHERE deleted_at IS NULL")
            .fetch_one(&pool)
            .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tStored graph node count:\t{} \n \
         \tActive story count:\t{}",
        node_count,
        story_count
    );

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::{init_logging, scenario_graph};
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> DbConnection {
        DbConnection(db_init(dir.path().join("test.db")).await.unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn graph_round_trips_through_tables() {
        init_logging();
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;

        let mut graph = scenario_graph();
        graph.nodes[0]
            .properties
            .insert("born".to_string(), "1901".to_string());
        db.put_graph("ts-1", &graph).await.unwrap();

        let loaded = db.graph("ts-1").await.unwrap();
        assert_eq!(loaded, graph);
        assert!(db.graph_document("ts-other").await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn reimport_drops_missing_nodes() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        db.put_graph("ts-1", &scenario_graph()).await.unwrap();

        let mut smaller = scenario_graph();
        smaller.nodes.retain(|n| n.id != "D");
        smaller.relationships.retain(|r| r.target_id != "D");
        db.put_graph("ts-1", &smaller).await.unwrap();

        let loaded = db.graph("ts-1").await.unwrap();
        assert_eq!(loaded.nodes.len(), 3);
        assert_eq!(loaded.relationships.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn graphs_past_the_variable_limit_import() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let count = SQLITE_LIMIT_VARIABLE_NUMBER + 10;
        let nodes: Vec<GraphNode> = (0..count)
            .map(|i| GraphNode {
                id: format!("n{i}"),
                name: format!("Node {i}"),
                label: "Entity".into(),
                ..Default::default()
            })
            .collect();
        let relationships = (1..count)
            .map(|i| GraphRelationship {
                id: format!("r{i}"),
                kind: "NEXT".into(),
                source_id: format!("n{}", i - 1),
                target_id: format!("n{i}"),
                ..Default::default()
            })
            .collect();
        let mut graph = GraphDocument::new(nodes, relationships);
        db.put_graph("big", &graph).await.unwrap();

        let loaded = db.graph("big").await.unwrap();
        assert_eq!(loaded.nodes.len(), count);
        assert_eq!(loaded.relationships.len(), count - 1);
        assert_eq!(loaded.nodes[count - 1].id, format!("n{}", count - 1));

        graph.nodes.truncate(count - 5);
        graph.relationships.truncate(count - 6);
        db.put_graph("big", &graph).await.unwrap();
        let loaded = db.graph("big").await.unwrap();
        assert_eq!(loaded.nodes.len(), count - 5);
        assert_eq!(loaded.relationships.len(), count - 6);
    }

    #[test_log::test(tokio::test)]
    async fn workspace_records_are_replaced() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir).await;
        let mut workspace = WorkspaceRecord {
            id: "ws-1".into(),
            owner_id: "alice".into(),
            collaborator_ids: vec!["bob".into()],
            referenced_topic_space_ids: vec!["T1".into(), "T2".into()],
        };
        db.put_workspace(&workspace).await.unwrap();
        assert_eq!(db.workspace("ws-1").await.unwrap(), Some(workspace.clone()));

        workspace.referenced_topic_space_ids = vec!["T2".into()];
        workspace.collaborator_ids.clear();
        db.put_workspace(&workspace).await.unwrap();
        let loaded = db.workspace("ws-1").await.unwrap().unwrap();
        assert_eq!(loaded.referenced_topic_space_ids, vec!["T2".to_string()]);
        assert!(!loaded.can_edit("bob"));
        assert!(loaded.can_edit("alice"));
        assert!(db.workspace("missing").await.unwrap().is_none());
    }
}
