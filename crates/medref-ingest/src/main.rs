//! Medref Ingest - reference data acquisition tool

use anyhow::Result;
use clap::{Parser, Subcommand};
use medref_common::logging::{init_logging, LogConfig, LogLevel};
use medref_ingest::config::IngestConfig;
use medref_ingest::service::IngestService;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "medref-ingest")]
#[command(author, version, about = "Medref reference data acquisition tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run acquisition for one source
    RunSource {
        /// Source to fetch (e.g. openfda, pubmed)
        source: String,

        /// Discard previous progress and start from the beginning
        #[arg(long)]
        force_fresh: bool,
    },

    /// Run acquisition for every configured source
    RunAll {
        /// Discard previous progress and start from the beginning
        #[arg(long)]
        force_fresh: bool,
    },

    /// Consolidate staged records into canonical entities
    Consolidate {
        /// Restrict to these sources (default: everything staged)
        #[arg(short, long)]
        sources: Vec<String>,
    },

    /// Show the persisted download state of a source
    Status {
        /// Source to inspect
        source: String,
    },

    /// Operator reset: discard the download state of a source
    Reset {
        /// Source to reset
        source: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("medref-ingest".to_string())
        .build();

    // Environment variables take precedence over flags
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    let config = IngestConfig::from_env()?;
    let service = IngestService::builder(config).build_default().await?;

    match cli.command {
        Command::RunSource {
            source,
            force_fresh,
        } => {
            let summary = service.run_source(&source, force_fresh).await?;
            info!(
                source_id = %summary.source_id,
                status = summary.final_status.as_str(),
                fetched = summary.items_fetched,
                valid = summary.items_valid,
                rejected = summary.items_rejected,
                duration_secs = summary.duration_secs,
                "Run finished"
            );
        },
        Command::RunAll { force_fresh } => {
            for result in service.run_all(force_fresh).await {
                match result {
                    Ok(summary) => info!(
                        source_id = %summary.source_id,
                        status = summary.final_status.as_str(),
                        fetched = summary.items_fetched,
                        "Run finished"
                    ),
                    Err(e) => tracing::error!(error = %e, "Run failed"),
                }
            }
        },
        Command::Consolidate { sources } => {
            let summary = service.run_consolidation(&sources).await?;
            info!(
                groups = summary.groups_processed,
                created = summary.entities_created,
                updated = summary.entities_updated,
                records = summary.records_consolidated,
                enrichment_failures = summary.enrichment_failures,
                "Consolidation finished"
            );
        },
        Command::Status { source } => match service.source_state(&source).await? {
            Some(state) => info!(
                source_id = %state.source_id,
                status = state.status.as_str(),
                completed_count = state.completed_count,
                cursor = ?state.cursor,
                daily_retry_count = state.daily_retry_count,
                "Download state"
            ),
            None => info!(source_id = %source, "No download state recorded"),
        },
        Command::Reset { source } => {
            service.reset_source(&source).await?;
        },
    }

    Ok(())
}
