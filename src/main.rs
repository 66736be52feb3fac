//! scopus-harvester - resumable Scopus metadata harvesting
//!
//! ## Usage
//!
//! ### Run a harvest
//! ```bash
//! SCOPUS_API_KEY=... scopus-harvester run --config harvest.json
//! ```
//!
//! ### Inspect the planned queries without fetching
//! ```bash
//! scopus-harvester plan --config harvest.json
//! ```
//!
//! Exit status is 0 when every query completed, 1 when some query failed or the
//! run was interrupted, and 2 on fatal errors (configuration, credentials, storage).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scopus_harvester::checkpoint::CheckpointStore;
use scopus_harvester::planner::QueryPlanner;
use scopus_harvester::{
    HarvestConfig, HarvestError, HarvestSummary, Harvester, PaginatedFetcher, ScopusClient,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Resumable bibliographic metadata harvester for the Scopus Search API
#[derive(Parser)]
#[command(name = "scopus-harvester")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) a harvest
    Run {
        /// Harvest configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Ignore existing checkpoint and output and start over
        #[arg(long)]
        fresh: bool,
    },

    /// Print the planned queries without contacting the API
    Plan {
        /// Harvest configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Manage the harvest checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Print the stored checkpoint
    Show {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Delete the stored checkpoint
    Clear {
        #[arg(short, long)]
        config: PathBuf,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    let result = match cli.command {
        Commands::Run { config, fresh } => run_harvest(&config, fresh).await,
        Commands::Plan { config } => show_plan(&config).map(|_| ExitCode::SUCCESS),
        Commands::Checkpoint { action } => handle_checkpoint(action).map(|_| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Fatal error");
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(debug: bool, json: bool) {
    let log_level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: &Path) -> Result<HarvestConfig> {
    HarvestConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

// ============================================================================
// Harvest
// ============================================================================

async fn run_harvest(config_path: &Path, fresh: bool) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if fresh {
        config.resume = false;
    }

    let api_key = std::env::var(&config.api.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .with_context(|| format!("Environment variable {} is not set", config.api.api_key_env))?;
    let client = ScopusClient::from_config(&config, api_key).context("Failed to create Scopus client")?;
    let fetcher = PaginatedFetcher::from_config(client, &config);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping the harvest");
                cancel.cancel();
            }
        }
    });

    println!("Output: {}", config.output.path.display());
    let summary = match Harvester::new(config, fetcher).with_cancellation(cancel).run().await {
        Ok(summary) => summary,
        Err(HarvestError::Aborted { summary, source }) => {
            print_summary(&summary);
            return Err(anyhow::Error::from(*source).context("Harvest aborted"));
        }
        Err(e) => return Err(anyhow::Error::from(e).context("Harvest aborted")),
    };

    print_summary(&summary);
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn print_summary(summary: &HarvestSummary) {
    println!("\n--- Harvest {} ---", summary.harvest_id);
    println!(
        "Queries: {} planned, {} completed, {} skipped, {} failed",
        summary.planned, summary.completed, summary.skipped, summary.failed
    );
    if summary.unfiltered_hits > 0 {
        println!(
            "Hits: {} before query filters, {} after",
            summary.unfiltered_hits, summary.total_hits
        );
    }
    println!(
        "Records: {} fetched, {} written, {} duplicates, {} filtered",
        summary.records_fetched,
        summary.records_written,
        summary.duplicates,
        summary.filtered.total()
    );
    for outcome in summary.queries.iter().filter(|q| q.error.is_some()) {
        println!(
            "  Failed {}: {}",
            outcome.query_id,
            outcome.error.as_deref().unwrap_or_default()
        );
    }
    if let Some(fatal) = &summary.fatal_error {
        println!("Aborted: {}", fatal);
    } else if summary.interrupted {
        println!("Interrupted. Run again to resume.");
    }
}

// ============================================================================
// Plan & Checkpoint
// ============================================================================

fn show_plan(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let plan = QueryPlanner::from_config(&config).plan(&config);

    println!("{} queries planned:", plan.queries.len());
    for query in &plan.queries {
        let years = query.years.map(|y| y.to_string()).unwrap_or_else(|| "all years".to_string());
        println!("  {}  [{}]  {}", query.id, years, query.expression);
    }
    for warning in &plan.warnings {
        println!("Warning: {}", warning);
    }
    Ok(())
}

fn handle_checkpoint(action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::Show { config } => {
            let config = load_config(&config)?;
            let mut store = CheckpointStore::new(config.checkpoint_path());
            let checkpoint = store.load().context("Failed to read checkpoint")?;
            println!("Checkpoint file: {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        CheckpointAction::Clear { config } => {
            let config = load_config(&config)?;
            let mut store = CheckpointStore::new(config.checkpoint_path());
            store.clear().context("Failed to clear checkpoint")?;
            info!(path = %store.path().display(), "Checkpoint cleared");
            println!("Checkpoint cleared.");
        }
    }
    Ok(())
}
