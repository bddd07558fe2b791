//! # regwatch CLI
//!
//! ## Usage
//!
//! ```bash
//! regwatch --config ./config/regwatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `regwatch init` | Create the SQLite database and run schema migrations |
//! | `regwatch sources` | List the configured source registry |
//! | `regwatch run` | Crawl, analyze and persist all (or `--source`) sources |
//! | `regwatch backfill` | Re-resolve jurisdiction and re-score risk for stored events |
//! | `regwatch cleanup` | Re-clean stored text and merge converging rows |
//! | `regwatch sync-laws` | Rebuild canonical laws from stored events |

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use regwatch::progress::ProgressMode;
use regwatch::{backfill, cleanup, config, db, laws, migrate, pipeline, sources};

/// regwatch: crawl, classify and canonicalize regulation affecting online
/// services for minors.
#[derive(Parser)]
#[command(name = "regwatch", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/regwatch.toml")]
    config: PathBuf,

    /// Log output format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List configured sources.
    Sources,

    /// Run the crawl → analyze → persist pipeline once.
    Run {
        /// Only crawl these source ids (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Progress on stderr: `human`, `json`, or `off`.
        #[arg(long, default_value = "human")]
        progress: String,
    },

    /// Re-resolve jurisdiction and re-score risk for every stored event.
    Backfill,

    /// Re-clean stored titles and summaries, merging rows that converge.
    Cleanup,

    /// Rebuild canonical laws from stored events.
    SyncLaws,
}

fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("regwatch=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Run { sources, progress } => {
            let Some(mode) = ProgressMode::parse(&progress) else {
                bail!(
                    "Unknown progress mode: '{}'. Must be human, json, or off.",
                    progress
                );
            };
            let ids = (!sources.is_empty()).then_some(sources.as_slice());
            pipeline::run_and_report(&cfg, ids, Arc::from(mode.reporter())).await?;
        }
        Commands::Backfill => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let r = backfill::backfill_risk_and_jurisdiction(&pool, &cfg.sources).await?;
            pool.close().await;
            println!("backfill");
            println!("  scanned: {}", r.scanned);
            println!("  updated: {}", r.updated);
            println!("  risk updated: {}", r.risk_updated);
            println!("  jurisdiction updated: {}", r.jurisdiction_updated);
            println!("  merged: {}", r.merged);
            println!("  unknown jurisdiction: {} -> {}", r.unknown_before, r.unknown_after);
            println!("  high risk: {} -> {}", r.high_risk_before, r.high_risk_after);
            println!("ok");
        }
        Commands::Cleanup => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let r = cleanup::run_data_cleanup(&pool).await?;
            pool.close().await;
            println!("cleanup");
            println!("  cleaned: {}", r.cleaned);
            println!("  merged: {}", r.merged);
            if r.errors.is_empty() {
                println!("ok");
            } else {
                println!("  errors: {}", r.errors.len());
                for error in &r.errors {
                    println!("    {}", error);
                }
                println!("partial");
            }
        }
        Commands::SyncLaws => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;
            let r = laws::sync_laws_from_events(&pool).await?;
            pool.close().await;
            println!("sync-laws");
            println!("  scanned events: {}", r.scanned);
            println!("  inserted laws: {}", r.inserted_laws);
            println!("  inserted updates: {}", r.inserted_updates);
            println!("  linked events: {}", r.linked_events);
            println!("  merged duplicates: {}", r.merged_duplicates);
            println!("ok");
        }
    }

    Ok(())
}
