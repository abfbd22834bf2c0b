//! CLI command definitions for stilq.
//!
//! `submit` queues a source table as one batch, `drive` runs a single
//! scheduling cycle (meant for cron), and `status` summarizes the queue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::error;

use crate::config::SchedulerConfig;
use crate::notify::notifier_from_config;
use crate::runner::{ClusterBackend, SlurmBackend};
use crate::scheduler::batch::{overview, BatchOverview};
use crate::scheduler::driver::Driver;
use crate::scheduler::queue::QueueStore;
use crate::submit::{SubmissionValidator, Submitter};

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = "stilq.yaml";

/// Single-consumer job queue for pattern conversion.
#[derive(Parser)]
#[command(name = "stilq")]
#[command(about = "Queue and run pattern conversion jobs against a license-limited tool")]
#[command(version)]
#[command(
    long_about = "stilq queues pattern conversion tasks submitted as CSV tables and runs them one at a time.\n\nRun `stilq drive` from cron; each invocation runs at most one task.\n\nExample usage:\n  stilq submit release.csv --mode smt8\n  stilq drive\n  stilq status"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Configuration file.
    #[arg(short, long, env = "STILQ_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,
}

impl Cli {
    /// Log filter requested on the command line; `drive -v` raises it to debug.
    pub fn log_filter(&self) -> String {
        match &self.command {
            Commands::Drive(args) if args.verbose => "debug".to_string(),
            _ => self.log_level.clone(),
        }
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Validate a source table and queue its rows as one batch.
    Submit(SubmitArgs),

    /// Run one scheduling cycle.
    ///
    /// Exits zero when another driver holds the lock, when admission is
    /// blocked, and when there is nothing to do.
    Drive(DriveArgs),

    /// Show per-batch task counts.
    Status(StatusArgs),
}

/// Arguments for `stilq submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Source CSV with an InputPath (or STIL_Path) column.
    pub source: PathBuf,

    /// Execution mode for every task (smt7, smt8). Defaults to the configured mode.
    #[arg(short, long)]
    pub mode: Option<String>,

    /// Notification address. Defaults to <user>@<email.domain>.
    #[arg(short, long)]
    pub email: Option<String>,
}

/// Arguments for `stilq drive`.
#[derive(Parser, Debug)]
pub struct DriveArgs {
    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Arguments for `stilq status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = SchedulerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Submit(args) => run_submit_command(&config, args),
        Commands::Drive(_) => run_drive_command(&config).await,
        Commands::Status(args) => run_status_command(&config, args),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn run_submit_command(config: &SchedulerConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let validator = SubmissionValidator::from_config(config);
    let submitter = Submitter::from_env(&config.email.domain, args.email);
    let receipt = validator
        .submit(&args.source, args.mode.as_deref(), &submitter)
        .with_context(|| format!("Submission of {} rejected", args.source.display()))?;

    println!("✓ Submitted batch {}", receipt.batch_id);
    println!("  Tasks:  {}", receipt.count);
    println!("  Notify: {}", submitter.email);
    Ok(())
}

async fn run_drive_command(config: &SchedulerConfig) -> anyhow::Result<()> {
    let backend: Arc<dyn ClusterBackend> = Arc::new(SlurmBackend::new(
        config.remote.query_program.clone(),
        config.remote.launcher.clone(),
    ));
    let driver = Driver::from_config(config, backend, notifier_from_config(&config.email));

    // Cycle failures after setup are reported, not propagated: the next
    // cron tick retries.
    match driver.run_cycle_with(|claimed| println!("{}", claimed)).await {
        Ok(outcome) => {
            println!("{}", outcome);
            if let Some(closed) = outcome.closed_batch() {
                println!(
                    "Batch closed: {} ({} Passed, {} Failed, {} Skipped)",
                    closed.report.subject(),
                    closed.report.passed,
                    closed.report.failed,
                    closed.report.skipped
                );
            }
        }
        Err(e) => error!(error = %e, "Driver cycle failed"),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    queue_file: PathBuf,
    batches: Vec<BatchOverview>,
    malformed_rows: usize,
}

fn run_status_command(config: &SchedulerConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = QueueStore::new(config.paths.queue_file.clone());
    let table = store.snapshot()?;
    let output = StatusOutput {
        queue_file: store.path().to_path_buf(),
        batches: overview(&table),
        malformed_rows: table.malformed_count(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if output.batches.is_empty() {
        println!("No batches in {}", output.queue_file.display());
    }
    for batch in &output.batches {
        let c = &batch.counts;
        println!(
            "{:<32} {:<10} {:<6} pending {:>3}  running {:>3}  complete {:>3}  failed {:>3}  skipped {:>3}",
            batch.id,
            batch.submitted_by,
            if c.is_closed() { "closed" } else { "open" },
            c.pending,
            c.running,
            c.complete,
            c.failed,
            c.skipped
        );
    }
    if output.malformed_rows > 0 {
        println!("Malformed rows: {}", output.malformed_rows);
    }
    Ok(())
}
