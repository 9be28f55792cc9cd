//! Command-line interface for nuage.
//!
//! Provides commands for applying and destroying definitions, previewing
//! the execution plan, and inspecting deployment state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{load_config, ResolvedConfig};
use crate::core::{CellOutcome, Definition, DependencyGraph, Journal, Orchestrator};
use crate::domain::{ApplyReport, DeploymentState, LastApply, NodeState};

/// nuage - Dependency-ordered provisioning orchestrator
#[derive(Parser, Debug)]
#[command(name = "nuage")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create or update every resource in a definition
    Apply {
        /// Definition file (YAML)
        file: PathBuf,

        /// Deployment name (defaults to the definition name)
        #[arg(short, long)]
        deployment: Option<String>,

        /// Maximum resources provisioned at once
        #[arg(short, long, env = "NUAGE_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Ignore recorded state and create everything
        #[arg(long)]
        fresh: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete recorded resources in reverse dependency order
    Destroy {
        /// Definition file (YAML)
        file: PathBuf,

        /// Deployment name (defaults to the definition name)
        #[arg(short, long)]
        deployment: Option<String>,

        /// Maximum resources deleted at once
        #[arg(short, long, env = "NUAGE_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the dependency levels a definition would execute in
    Plan {
        /// Definition file (YAML)
        file: PathBuf,

        /// Deployment to compare against (defaults to the definition name)
        #[arg(short, long)]
        deployment: Option<String>,
    },

    /// Show the recorded state of a deployment
    Status {
        /// Deployment name
        deployment: String,
    },

    /// List deployments with a journal
    Deployments,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command, returning the process exit status
    pub async fn execute(self) -> Result<i32> {
        match self.command {
            Commands::Apply {
                file,
                deployment,
                concurrency,
                fresh,
                json,
            } => apply(&file, deployment, concurrency, fresh, json).await,
            Commands::Destroy {
                file,
                deployment,
                concurrency,
                json,
            } => destroy(&file, deployment, concurrency, json).await,
            Commands::Plan { file, deployment } => plan(&file, deployment).await.map(|()| 0),
            Commands::Status { deployment } => show_status(&deployment).await.map(|()| 0),
            Commands::Deployments => list_deployments().await.map(|()| 0),
            Commands::Config => show_config().map(|()| 0),
        }
    }
}

/// Load a definition and build its graph
fn load_graph(file: &Path) -> Result<(Definition, DependencyGraph)> {
    let definition = Definition::from_file(file)?;
    let root = definition
        .build()
        .with_context(|| format!("Invalid definition: {}", file.display()))?;
    let graph = DependencyGraph::build(root)
        .with_context(|| format!("Invalid dependency graph: {}", file.display()))?;
    Ok((definition, graph))
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing running resources");
            token.cancel();
        }
    })
}

fn orchestrator(config: &ResolvedConfig, concurrency: Option<usize>, journal: Arc<Journal>) -> Orchestrator {
    let mut engine = config.engine.clone();
    if let Some(limit) = concurrency {
        engine = engine.with_concurrency_limit(limit);
    }
    Orchestrator::new(engine).with_journal(journal)
}

/// Apply a definition
async fn apply(
    file: &Path,
    deployment: Option<String>,
    concurrency: Option<usize>,
    fresh: bool,
    json: bool,
) -> Result<i32> {
    let config = load_config()?;
    let (definition, graph) = load_graph(file)?;
    let deployment = deployment.unwrap_or_else(|| definition.name.clone());

    let journal = Arc::new(Journal::open(&config.deployments_dir(), &deployment).await?);
    let _lock = journal.lock()?;
    let state = if fresh {
        DeploymentState::default()
    } else {
        journal.state().await?
    };

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let report = orchestrator(&config, concurrency, journal)
        .apply_with(&graph, &state, cancel)
        .await;
    watcher.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        print_outputs(&graph);
    }
    Ok(report.exit_code())
}

/// Destroy a deployment's recorded resources
async fn destroy(file: &Path, deployment: Option<String>, concurrency: Option<usize>, json: bool) -> Result<i32> {
    let config = load_config()?;
    let (definition, graph) = load_graph(file)?;
    let deployment = deployment.unwrap_or_else(|| definition.name.clone());

    let journal = Arc::new(Journal::open(&config.deployments_dir(), &deployment).await?);
    let _lock = journal.lock()?;
    let state = journal.state().await?;

    let orphaned: Vec<_> = state
        .resources
        .keys()
        .filter(|id| graph.node(id.as_str()).is_none())
        .collect();
    if !orphaned.is_empty() {
        warn!(count = orphaned.len(), "Recorded resources are not in the definition and will be kept");
    }

    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let report = orchestrator(&config, concurrency, journal)
        .destroy(&graph, &state, cancel)
        .await;
    watcher.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.exit_code())
}

/// Print the execution plan
async fn plan(file: &Path, deployment: Option<String>) -> Result<()> {
    let config = load_config()?;
    let (definition, graph) = load_graph(file)?;
    let deployment = deployment.unwrap_or_else(|| definition.name.clone());

    let existing = Journal::list_deployments(&config.deployments_dir()).await?;
    let state = if existing.contains(&deployment) {
        Journal::open(&config.deployments_dir(), &deployment)
            .await?
            .state()
            .await?
    } else {
        DeploymentState::default()
    };

    println!("Plan for '{}' ({} resources)", graph.name(), graph.len());
    for (level, nodes) in graph.levels().iter().enumerate() {
        println!("\nLevel {}:", level);
        for id in nodes {
            let Some(node) = graph.node(id.as_str()) else {
                continue;
            };
            let action = if state.get(id).is_some() {
                "create or update"
            } else {
                "create"
            };
            let deps: Vec<String> = graph.dependencies(id.as_str()).iter().map(|d| d.to_string()).collect();
            println!("  {:<40} {:<20} {}", id, node.provisioner().name(), action);
            if !deps.is_empty() {
                println!("    after: {}", deps.join(", "));
            }
        }
    }

    Ok(())
}

/// Show recorded state of a deployment
async fn show_status(deployment: &str) -> Result<()> {
    let config = load_config()?;
    let existing = Journal::list_deployments(&config.deployments_dir()).await?;
    if !existing.iter().any(|d| d == deployment) {
        anyhow::bail!("No deployment named '{}'", deployment);
    }

    let journal = Journal::open(&config.deployments_dir(), deployment).await?;
    let state = journal.state().await?;

    println!("Deployment: {}", deployment);
    println!("Applies: {}", state.apply_count);
    if let Some(apply_id) = state.last_apply_id {
        let outcome = match state.last_apply {
            Some(LastApply::Completed) => "completed",
            Some(LastApply::Failed) => "failed",
            Some(LastApply::Aborted) => "aborted",
            Some(LastApply::Interrupted) | None => "interrupted",
        };
        println!("Last apply: {} ({})", apply_id, outcome);
    }

    if state.is_empty() {
        println!("\nNo resources recorded");
        return Ok(());
    }

    println!("\n{:<40} {:<20} {:<26}", "RESOURCE", "KEY", "UPDATED");
    println!("{}", "-".repeat(86));
    for (id, record) in &state.resources {
        let hash = record.idempotency_key.rsplit(':').next().unwrap_or_default();
        println!("{:<40} {:<20} {:<26}", id, hash, record.updated_at.to_rfc3339());
    }

    Ok(())
}

/// List deployments
async fn list_deployments() -> Result<()> {
    let config = load_config()?;
    let deployments = Journal::list_deployments(&config.deployments_dir()).await?;

    if deployments.is_empty() {
        println!("No deployments found");
        return Ok(());
    }

    for deployment in deployments {
        println!("{}", deployment);
    }
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = load_config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:        {}", cfg.home.display());
    println!("  Deployments: {}", cfg.deployments_dir().display());
    println!();
    println!("Engine:");
    match cfg.engine.concurrency_limit {
        Some(limit) => println!("  Concurrency:  {}", limit),
        None => println!("  Concurrency:  unbounded"),
    }
    match cfg.engine.default_timeout {
        Some(timeout) => println!("  Timeout:      {}s", timeout.as_secs()),
        None => println!("  Timeout:      none"),
    }
    println!("  Max attempts: {}", cfg.engine.retry_policy.max_attempts);
    println!(
        "  Backoff:      {}ms x{} (max {}ms)",
        cfg.engine.retry_policy.initial_delay_ms,
        cfg.engine.retry_policy.backoff_multiplier,
        cfg.engine.retry_policy.max_delay_ms
    );

    Ok(())
}

fn state_label(state: NodeState) -> &'static str {
    match state {
        NodeState::Pending => "not started",
        NodeState::Ready => "ready",
        NodeState::Running => "running",
        NodeState::Succeeded => "succeeded",
        NodeState::Failed => "FAILED",
        NodeState::Skipped => "skipped",
    }
}

/// Print a per-node table followed by failures
pub fn print_report(report: &ApplyReport) {
    println!("{:<40} {:<12} {:<10} {:>8} {:>10}", "RESOURCE", "STATE", "OPERATION", "ATTEMPTS", "DURATION");
    println!("{}", "-".repeat(84));
    for node in &report.nodes {
        let operation = node.operation.map(|op| op.to_string()).unwrap_or_else(|| "-".to_string());
        let duration = node
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<12} {:<10} {:>8} {:>10}",
            node.node_id,
            state_label(node.state),
            operation,
            node.attempts,
            duration
        );
    }

    let failures: Vec<_> = report.nodes.iter().filter(|n| n.state == NodeState::Failed).collect();
    if !failures.is_empty() {
        println!("\nFailures:");
        for node in failures {
            if let Some(ref error) = node.error {
                println!("  {}: {}", node.node_id, error);
            }
        }
    }

    let skipped = report.count(NodeState::Skipped);
    eprintln!(
        "\n[{:?} {} {:?}: {} succeeded, {} failed, {} skipped]",
        report.kind,
        report.apply_id,
        report.verdict,
        report.count(NodeState::Succeeded),
        report.count(NodeState::Failed),
        skipped
    );
}

/// Print the root group's exposed outputs that resolved
fn print_outputs(graph: &DependencyGraph) {
    if graph.outputs().is_empty() {
        return;
    }

    println!("\nOutputs:");
    for (name, cell) in graph.outputs() {
        match cell.try_get() {
            Some(CellOutcome::Resolved(value)) => println!("  {} = {}", name, value),
            Some(CellOutcome::Failed(_)) | None => println!("  {} = (unavailable)", name),
        }
    }
}
