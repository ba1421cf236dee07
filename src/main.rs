use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use weave::agent::ScriptedAgent;
use weave::config::{EngineConfig, ExecutionMode};
use weave::models::Project;
use weave::pipeline::{PipelineCoordinator, ScriptedPlanner};
use weave::store::{Datastore, MemoryStore};

#[derive(Parser)]
#[command(name = "weave")]
#[command(version, about = "Orchestration engine for agent-driven slice builds")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scripted end-to-end pipeline against an in-memory store
    Rehearse {
        /// Project name shown in the run output
        #[arg(long, default_value = "rehearsal-project")]
        name: String,

        /// Milliseconds to pause between appended events
        #[arg(long, default_value = "0")]
        pacing_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Rehearse { name, pacing_ms } => rehearse(&name, pacing_ms).await,
    }
}

async fn rehearse(name: &str, pacing_ms: u64) -> Result<()> {
    let store = MemoryStore::new();
    let project = Project::new(name);
    let project_id = project.id.clone();
    store.upsert_project(project).await?;

    let plan = ScriptedPlanner::demo_plan();
    let config = EngineConfig::default()
        .with_mode(ExecutionMode::Rehearsal)
        .with_event_pacing(Duration::from_millis(pacing_ms));
    let coordinator = PipelineCoordinator::new(
        store.clone(),
        ScriptedAgent::happy(plan.len()),
        ScriptedPlanner::new(plan),
        config,
    );

    let status = coordinator.start(&project_id).await?;
    coordinator.shutdown().await;

    println!("Project '{}' finished: {}", name, status);
    for slice in store.list_slices(&project_id).await? {
        let events = store.list_events(&slice.id).await?;
        println!(
            "  [{}] {} (confidence {:.2}, {} events)",
            slice.status,
            slice.name,
            slice.confidence_score,
            events.len()
        );
    }

    let project = store.get_project(&project_id).await?;
    if let Some(ctx) = project.error_context {
        println!("  error at step '{}': {}", ctx.step, ctx.message);
    }
    Ok(())
}
