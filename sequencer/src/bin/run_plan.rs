//! Run a scheduled observation plan against the configured telescope.
//!
//! Ctrl-C requests a cooperative abort: the current phase finishes, the
//! telescope parks (unless `--no-park`), and the partial result is still
//! written out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use hardware::telescope::AdapterRegistry;
use sequencer::{load_plan, ExecutionOrchestrator, ExecutionState};
use shared::{ConfigStorage, ObservatoryContext};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Smart Telescope Plan Runner
#[derive(Parser, Debug)]
#[command(name = "run_plan")]
#[command(about = "Execute a scheduled target plan on a smart telescope")]
#[command(version)]
struct Args {
    /// Plan file: JSON array of scheduled targets
    plan: PathBuf,

    /// Execution id (defaults to a timestamp)
    #[arg(long)]
    execution_id: Option<String>,

    /// Where to write the execution result JSON
    #[arg(short, long, default_value = "execution_result.json")]
    output: PathBuf,

    /// Config directory (defaults to ~/.seestar_config)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Device host (overrides the stored config)
    #[arg(long)]
    host: Option<String>,

    /// Device port (overrides the stored config)
    #[arg(long)]
    port: Option<u16>,

    /// Retries per failed phase (overrides the stored config)
    #[arg(long)]
    retries: Option<u32>,

    /// Leave the telescope unparked when the plan ends
    #[arg(long)]
    no_park: bool,

    /// Save the effective config back to the config directory
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let storage = match &args.config_dir {
        Some(dir) => ConfigStorage::with_path(dir.clone()),
        None => ConfigStorage::new().context("Failed to locate config directory")?,
    };
    let mut context = ObservatoryContext::load(storage).context("Failed to load config")?;
    if let Some(host) = args.host {
        context.config.device.host = host;
    }
    if let Some(port) = args.port {
        context.config.device.port = port;
    }
    if let Some(retries) = args.retries {
        context.config.execution.phase_retries = retries;
    }
    if args.no_park {
        context.config.execution.park_on_completion = false;
    }
    if args.save_config {
        let path = context.storage.save_observatory_config(&context.config)?;
        info!("Saved config to {}", path.display());
    }

    let plan = load_plan(&args.plan)
        .with_context(|| format!("Failed to load plan {}", args.plan.display()))?;
    let execution_id = args
        .execution_id
        .unwrap_or_else(|| Utc::now().format("run-%Y%m%dT%H%M%SZ").to_string());

    let device = &context.config.device;
    let mut adapter = AdapterRegistry::with_defaults().create(device)?;
    info!(
        "Connecting to {} adapter at {}:{}",
        adapter.kind(),
        device.host,
        device.port
    );
    if !adapter.connect(&device.host, device.port).await {
        bail!("Could not connect to {}:{}", device.host, device.port);
    }

    let orchestrator = Arc::new(ExecutionOrchestrator::from_context(adapter, &context));

    let abort_handle = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, aborting at the next phase boundary");
            abort_handle.abort();
        }
    });

    let mut progress = orchestrator.subscribe();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            if let (Some(index), Some(phase)) = (p.current_target_index, p.current_phase) {
                info!(
                    "[{:>5.1}%] target {}/{} {phase}",
                    p.progress_percent,
                    index + 1,
                    p.total_targets
                );
            }
        }
    });

    let result = orchestrator.execute(&execution_id, &plan).await?;
    reporter.abort();
    orchestrator.adapter().lock().await.disconnect().await;

    println!();
    println!("Execution {}: {}", result.execution_id, result.state);
    println!(
        "  {} completed, {} failed of {} ({:.0}%) in {:.0}s",
        result.progress.targets_completed,
        result.progress.targets_failed,
        result.progress.total_targets,
        result.progress.progress_percent,
        result.duration_seconds()
    );
    for target in &result.targets {
        println!("  #{:<3} {:<24} {:?}", target.index, target.target_name, target.outcome);
    }
    if !result.errors.is_empty() {
        println!("Errors:");
        for error in &result.errors {
            println!(
                "  {} #{} {} [{}] retry {}: {}",
                error.timestamp.format("%H:%M:%S"),
                error.target_index,
                error.target_name,
                error.phase,
                error.retry_count,
                error.message
            );
        }
    }

    result
        .save_to_file(&args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!("Result written to {}", args.output.display());

    if result.state == ExecutionState::Error {
        bail!("Execution ended in ERROR");
    }
    Ok(())
}
