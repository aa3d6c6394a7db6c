//! `fleetlift-worker` entry point.
//!
//! This binary wires the engine's infrastructure adapters together: it
//! loads configuration, initializes structured logging, opens the
//! durable workflow store, and exposes the client API (§6.2) over a
//! minimal local CLI. The full task-file CLI (YAML parsing into a
//! `Task`, rich output formatting) is an external collaborator per
//! spec.md §1; this binary only accepts an already-serialized JSON task
//! so the engine can be driven end-to-end without it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fleetlift::infrastructure::config::ConfigLoader;
use fleetlift::infrastructure::knowledge_store::YamlKnowledgeStore;
use fleetlift::infrastructure::sandbox::LocalProcessSandboxProvider;
use fleetlift::infrastructure::workflow_store::SqliteWorkflowStore;
use fleetlift::services::client_api::ClientApi;

#[derive(Parser)]
#[command(name = "fleetlift-worker", version, about = "Fleetlift orchestration worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a transform workflow from a JSON-serialized Task and poll
    /// it to completion, printing the final result.
    Run {
        /// Path to a JSON file containing a serialized Task (§3.1).
        task_file: PathBuf,
    },
    /// Print the worker's resolved configuration and exit.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load().context("failed to load worker configuration")?;
    let _logger = fleetlift::infrastructure::logging::LoggerImpl::init(&config.logging)
        .context("failed to initialize logging")?;

    match cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run { task_file } => run_task(&config, &task_file).await,
    }
}

async fn run_task(config: &fleetlift::infrastructure::config::WorkerConfig, task_file: &PathBuf) -> Result<()> {
    let task_bytes = tokio::fs::read(task_file)
        .await
        .with_context(|| format!("failed to read task file {}", task_file.display()))?;
    let task: fleetlift::Task = serde_json::from_slice(&task_bytes).context("task file is not valid JSON")?;

    let provider = LocalProcessSandboxProvider::new(config.sandbox.clone());
    let store = Arc::new(
        SqliteWorkflowStore::connect(&expand_home(&config.state.workflow_db_path))
            .await
            .context("failed to open workflow store")?,
    );
    let knowledge_dir = PathBuf::from(expand_home(&config.state.state_dir)).join("knowledge");
    let knowledge_store: Arc<dyn fleetlift::domain::ports::KnowledgeStore> =
        Arc::new(YamlKnowledgeStore::new(&knowledge_dir, &task.id));

    let api = ClientApi::new(provider, store).with_knowledge_store(knowledge_store);
    let workflow_id = api
        .start_transform(task.clone())
        .await
        .context("failed to start transform workflow")?;

    record_last_workflow(&config.state.state_dir, &workflow_id).await?;

    loop {
        let state = api.get_status(&task.id).await?;
        tracing::info!(task_id = %task.id, state = ?state, "workflow state");
        if matches!(
            state,
            fleetlift::domain::models::workflow::WorkflowState::Completed
                | fleetlift::domain::models::workflow::WorkflowState::Failed
                | fleetlift::domain::models::workflow::WorkflowState::Cancelled
        ) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    if let Some(result) = api.get_result(&task.id).await? {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(())
}

/// Record the most recently started workflow id for operator
/// convenience (§6.3: `~/.fleetlift/last-workflow`, mode 0600).
async fn record_last_workflow(state_dir: &str, workflow_id: &str) -> Result<()> {
    let dir = expand_home(state_dir);
    tokio::fs::create_dir_all(&dir).await.ok();
    let path = PathBuf::from(&dir).join("last-workflow");
    tokio::fs::write(&path, workflow_id).await.context("failed to record last-workflow file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&path, perms).await.ok();
    }
    Ok(())
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    path.to_string()
}
