//! `incident-workflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `migrate`     run pending database migrations.
//! - `validate`    check a workflow export document without touching the database.
//! - `import`      store a workflow export document under fresh ids.
//! - `export`      print a stored workflow as an export document.
//! - `set-default` make a workflow the default for its record kinds.
//! - `add-node`    add a classification, location or department.
//! - `tree`        print a classification, location or department tree.
//! - `sla-monitor` sweep for SLA breaches until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use actions::{DispatchConfig, RegistryDispatcher};
use engine::hierarchy::Hierarchy;
use engine::interchange;
use engine::{
    Clock, Collaborators, EngineConfig, IncidentEngine, PgStore, SlaMonitorConfig, SystemClock,
    WorkflowExport,
};

#[derive(Parser)]
#[command(
    name = "incident-workflow",
    about = "State-machine workflow engine for ITSM incidents",
    version
)]
struct Cli {
    /// Postgres connection string.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, global = true, default_value_t = 5)]
    max_connections: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations.
    Migrate,
    /// Validate a workflow export document.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Import a workflow export document.
    Import {
        path: PathBuf,
    },
    /// Print a stored workflow as JSON.
    Export {
        workflow_id: Uuid,
    },
    /// Make a workflow the default for the record kinds it applies to.
    SetDefault {
        workflow_id: Uuid,
    },
    /// Add a node to one of the directory trees.
    AddNode {
        #[arg(value_enum)]
        tree: Tree,
        name: String,
        #[arg(long)]
        parent: Option<Uuid>,
    },
    /// Print one of the directory trees as JSON.
    Tree {
        #[arg(value_enum)]
        tree: Tree,
        #[arg(long, default_value_t = 8)]
        depth: usize,
    },
    /// Mark incidents whose SLA deadline has passed, every `interval` seconds.
    SlaMonitor {
        #[arg(long, env = "SLA_SWEEP_INTERVAL_SECS", default_value_t = 60)]
        interval: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Tree {
    Classifications,
    Locations,
    Departments,
}

impl From<Tree> for Hierarchy {
    fn from(tree: Tree) -> Self {
        match tree {
            Tree::Classifications => Hierarchy::Classifications,
            Tree::Locations => Hierarchy::Locations,
            Tree::Departments => Hierarchy::Departments,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { ref path } => validate(path),
        Command::Migrate => {
            let store = connect(&cli).await?;
            store.migrate().await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(())
        }
        Command::Import { ref path } => {
            let doc = read_export(path)?;
            let engine = engine_for(connect(&cli).await?);
            let id = engine.import_workflow(&doc).await?;
            println!("{id}");
            Ok(())
        }
        Command::Export { workflow_id } => {
            let engine = engine_for(connect(&cli).await?);
            let doc = engine.export_workflow(workflow_id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
            Ok(())
        }
        Command::SetDefault { workflow_id } => {
            let engine = engine_for(connect(&cli).await?);
            engine.set_default_workflow(workflow_id).await?;
            info!("workflow {} is now the default", workflow_id);
            Ok(())
        }
        Command::AddNode { tree, ref name, parent } => {
            let store = connect(&cli).await?;
            let node = store.add_node(tree.into(), name, parent).await?;
            println!("{}", serde_json::to_string_pretty(&node)?);
            Ok(())
        }
        Command::Tree { tree, depth } => {
            let store = connect(&cli).await?;
            let forest = store.tree(tree.into(), depth).await?;
            println!("{}", serde_json::to_string_pretty(&forest)?);
            Ok(())
        }
        Command::SlaMonitor { interval } => {
            let engine = engine_for(connect(&cli).await?);
            let monitor = engine.sla_monitor(SlaMonitorConfig {
                interval: Duration::from_secs(interval),
            });
            monitor
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("cannot listen for ctrl-c: {}", e);
                    }
                })
                .await;
            Ok(())
        }
    }
}

async fn connect(cli: &Cli) -> Result<PgStore> {
    let url = cli
        .database_url
        .as_deref()
        .context("--database-url or DATABASE_URL is required")?;
    let store = PgStore::connect(url, cli.max_connections)
        .await
        .context("failed to connect to database")?;
    Ok(store)
}

fn engine_for(store: PgStore) -> IncidentEngine {
    let (workflows, instances, directory) = store.into_collaborators();
    // The CLI never executes transitions, so no action handlers are registered.
    let dispatcher = Arc::new(RegistryDispatcher::new(Default::default(), DispatchConfig::default()));
    IncidentEngine::new(
        Collaborators {
            workflows,
            instances,
            directory,
            dispatcher,
            clock: Arc::new(SystemClock),
        },
        EngineConfig::default(),
    )
}

fn read_export(path: &Path) -> Result<WorkflowExport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let doc = serde_json::from_str(&content).context("invalid workflow JSON")?;
    Ok(doc)
}

fn validate(path: &Path) -> Result<()> {
    let doc = read_export(path)?;
    match interchange::import(&doc, SystemClock.now()) {
        Ok(graph) => {
            println!(
                "Workflow '{}' is valid: {} states, {} transitions, initial state '{}'",
                graph.workflow().code,
                graph.states().len(),
                graph.transitions().len(),
                graph.initial_state().code
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Validation failed: {e}");
            std::process::exit(1);
        }
    }
}
