//! arstraverse CLI tool
//!
//! Command-line access to community detection and the story store.
//!
//! ## Commands
//!
//! - `init`: write a default configuration file
//! - `detect <graph.json>`: detect communities and print a fresh story as JSON
//! - `import-graph`, `workspace`: fill the graph and workspace tables
//! - `save`, `show`, `history`, `delete`: story persistence
//!
//! A typical round: `detect graph.json > story.json`, fill in titles and narrative, then
//! `save --workspace ws --topic-space ts --actor me story.json`.

use arstraverse_core::{
    config::{StoryConfig, StoryConfigProvider, TomlConfigProvider, DEFAULT_CONFIG_FILE},
    db::{db_init, DbConnection, WorkspaceRecord},
    graph::GraphDocument,
    pipeline::{generate_meta_graph, story_from_build},
    story::{store::StoryStore, MetaGraphStoryData},
    StoryError,
};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::{fs::read_to_string, path::Path, path::PathBuf};

#[derive(Parser)]
#[command(name = "arstraverse")]
#[command(author, version, about = "Community detection and story persistence for knowledge graphs", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Detect communities in a graph file and print the resulting story skeleton
    Detect {
        /// JSON file holding `{nodes, relationships}`
        graph: PathBuf,
    },

    /// Store a graph file as the graph of a topic-space
    ImportGraph {
        #[arg(long)]
        topic_space: String,
        graph: PathBuf,
    },

    /// Create or replace a workspace record
    Workspace {
        #[arg(long)]
        id: String,
        #[arg(long)]
        owner: String,
        #[arg(long = "collaborator")]
        collaborators: Vec<String>,
        #[arg(long = "topic-space")]
        topic_spaces: Vec<String>,
    },

    /// Save a story JSON file as the workspace's story
    Save {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        topic_space: String,
        #[arg(long)]
        actor: String,
        /// Note stored with the history snapshot of the replaced story
        #[arg(long)]
        description: Option<String>,
        story: PathBuf,
    },

    /// Print the workspace's story and its consistency
    Show {
        #[arg(long)]
        workspace: String,
    },

    /// List saved snapshots of the workspace's story, newest first
    History {
        #[arg(long)]
        workspace: String,
    },

    /// Soft-delete the workspace's story
    Delete {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        actor: String,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoryError> {
    let content = read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

async fn open_store(config: &StoryConfig) -> Result<StoryStore, StoryError> {
    let pool = db_init(config.database.clone()).await?;
    Ok(StoryStore::new(DbConnection(pool), config.meta_graph.clone()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let provider = TomlConfigProvider::new(cli.config.clone());

    if let Commands::Init { force } = cli.command {
        if cli.config.exists() && !force {
            eprintln!(
                "Error: {} already exists (use --force to overwrite)",
                cli.config.display()
            );
            std::process::exit(1);
        }
        provider.set_config(&StoryConfig::default())?;
        println!("Config file created: {}", cli.config.display());
        return Ok(());
    }

    let config = provider.get_config()?;

    if let Commands::Detect { graph } = &cli.command {
        let graph: GraphDocument = read_json(graph)?;
        match generate_meta_graph(Some(&graph), &config) {
            Some(build) => {
                let story = story_from_build(build, &graph);
                println!("{}", serde_json::to_string_pretty(&story)?);
            }
            None => eprintln!("No meta-graph: the graph is empty or detection failed"),
        }
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let store = open_store(&config).await?;
        match cli.command {
            Commands::Init { .. } | Commands::Detect { .. } => {}
            Commands::ImportGraph { topic_space, graph } => {
                let graph: GraphDocument = read_json(&graph)?;
                store.db().put_graph(&topic_space, &graph).await?;
                println!(
                    "Imported {} nodes / {} relationships into topic-space {}",
                    graph.nodes.len(),
                    graph.relationships.len(),
                    topic_space
                );
            }
            Commands::Workspace {
                id,
                owner,
                collaborators,
                topic_spaces,
            } => {
                store
                    .db()
                    .put_workspace(&WorkspaceRecord {
                        id: id.clone(),
                        owner_id: owner,
                        collaborator_ids: collaborators,
                        referenced_topic_space_ids: topic_spaces,
                    })
                    .await?;
                println!("Workspace {id} saved");
            }
            Commands::Save {
                workspace,
                topic_space,
                actor,
                description,
                story,
            } => {
                let data: MetaGraphStoryData = read_json(&story)?;
                let record = store
                    .upsert_story(&workspace, &topic_space, &data, &actor, description.as_deref())
                    .await?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            Commands::Show { workspace } => match store.get_story(&workspace).await? {
                Some(view) => {
                    if !view.consistency.is_consistent {
                        eprintln!("Warning: {}", view.consistency.message);
                    }
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                None => {
                    let consistency = store.workspace_consistency(&workspace).await?;
                    eprintln!("No story for workspace {workspace} ({})", consistency.message);
                }
            },
            Commands::History { workspace } => {
                let entries = store.story_history(&workspace).await?;
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
            Commands::Delete { workspace, actor } => {
                let record = store.soft_delete_story(&workspace, &actor).await?;
                println!(
                    "Story {} deleted at {}",
                    record.id,
                    record
                        .deleted_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default()
                );
            }
        }
        Ok::<(), StoryError>(())
    })?;

    Ok(())
}
