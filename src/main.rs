// src/main.rs
// Thin CLI wrapper over the milestone pipeline library, for manual
// operation and ops debugging.

use clap::{Parser, Subcommand};
use milestones::config::{self, EnvConfig, SettingsStore};
use milestones::llm::HttpAgentEndpoint;
use milestones::store::MilestoneStore;
use milestones::summarizer::Summarizer;
use milestones::vector::NullVectorIndexer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Session milestone pipeline operations
#[derive(Parser, Debug)]
#[command(name = "milestones")]
#[command(version)]
#[command(about = "Milestone extraction, enrichment, and vector-indexing pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current pipeline-status.json snapshot
    Status,
    /// Drain the summarizer queue for one project directory to completion
    RunOnce {
        /// Project directory whose queued milestones should be enriched
        #[arg(long)]
        project: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Status => print_status(),
        Command::RunOnce { project } => run_once(project).await?,
    }
    Ok(())
}

fn print_status() {
    let path = config::data_dir().join("pipeline-status.json");
    match std::fs::read_to_string(&path) {
        Ok(contents) => println!("{contents}"),
        Err(err) => println!("no status snapshot at {}: {err}", path.display()),
    }
}

async fn run_once(project: PathBuf) -> anyhow::Result<()> {
    let data_dir = config::data_dir();
    let store = Arc::new(MilestoneStore::new(data_dir.clone()));
    let settings = Arc::new(SettingsStore::new());
    let env = EnvConfig::from_env();
    let endpoint = Arc::new(HttpAgentEndpoint::new(env.agent_endpoint_url.clone()).with_bearer_token(env.agent_endpoint_token.clone()));
    let vector = Arc::new(NullVectorIndexer);
    let summarizer = Summarizer::new(Arc::clone(&store), endpoint, vector, Arc::clone(&settings), data_dir);

    let project_path = project.to_string_lossy().to_string();
    info!(project = %project_path, "rebuilding queue from on-disk Phase 1 milestones");

    // The summarizer's queue is in-memory only (spec §5), so a fresh CLI
    // invocation rebuilds it from the index rather than relying on state
    // left over from a prior run.
    let mut queued_sessions = 0usize;
    for session_id in store.sessions_needing_enrichment() {
        let milestones = store.get_milestones(&session_id);
        let pending: Vec<usize> = milestones.iter().filter(|m| m.phase2.is_none()).map(|m| m.index).collect();
        if !pending.is_empty() {
            summarizer.add_to_queue(&session_id, &pending, Some(project_path.clone()));
            queued_sessions += 1;
        }
    }

    if summarizer.queue_len() == 0 {
        info!(sessions_scanned = queued_sessions, "nothing to enrich, queue is empty");
        return Ok(());
    }

    let ctrl_c_summarizer = Arc::clone(&summarizer);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, draining in-flight batches");
            ctrl_c_summarizer.stop();
        }
    });

    summarizer.start_processing();
    while summarizer.queue_len() > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }

    info!("queue drained");
    Ok(())
}
