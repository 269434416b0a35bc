use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pend_import::{build_scheduler, organize_once, report_markdown, run_import_once, ImportConfig};
use pend_storage::Ledger;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pend-cli")]
#[command(about = "Pendências spreadsheet ingestion")]
struct Cli {
    /// Directory scanned for new spreadsheets.
    #[arg(long, global = true)]
    intake: Option<PathBuf>,
    #[arg(long, global = true)]
    processed: Option<PathBuf>,
    #[arg(long, global = true)]
    errors: Option<PathBuf>,
    /// SQLite store location.
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import the intake directory and export the views.
    Import,
    /// Move already-imported files out of the intake directory.
    Organize,
    /// Summarize the most recent exported runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Create the store, add the `fonte` column older stores lack and print its capabilities.
    Migrate,
    /// Run the import on the configured cron schedule until Ctrl-C.
    Schedule,
}

impl Cli {
    fn config(&self) -> ImportConfig {
        let mut config = ImportConfig::from_env();
        if let Some(dir) = &self.intake {
            config.dirs.intake = dir.clone();
        }
        if let Some(dir) = &self.processed {
            config.dirs.processed = dir.clone();
        }
        if let Some(dir) = &self.errors {
            config.dirs.errors = dir.clone();
        }
        if let Some(path) = &self.database {
            config.database_path = path.clone();
        }
        config
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PEND_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;
    let config = cli.config();

    match cli.command.unwrap_or(Commands::Import) {
        Commands::Import => {
            let run = run_import_once(&config).await?;
            println!("{}", run.export.status_line);
            for detail in &run.report.details {
                println!(
                    "  {} {} read={} inserted={}{}",
                    detail.status,
                    detail.file_name,
                    detail.rows_read,
                    detail.rows_inserted,
                    detail
                        .error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
            println!("reports: {}", run.export.reports_dir.display());
        }
        Commands::Organize => {
            let report = organize_once(&config).await?;
            println!(
                "organize complete: moved={} copied={} pending={} failed={}",
                report.moved, report.copied, report.pending, report.failed
            );
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
        Commands::Migrate => {
            let mut ledger = Ledger::open(&config.database_path)
                .await
                .with_context(|| format!("opening store {}", config.database_path.display()))?;
            let added = ledger.upgrade().await.context("upgrading store")?;
            if !added.is_empty() {
                println!("added columns: {}", added.join(", "));
            }
            let schema = ledger.schema();
            println!(
                "store ready: {} file_identity={:?} record_fingerprint={} records={}",
                config.database_path.display(),
                schema.file_identity(),
                schema.tracks_record_fingerprint(),
                ledger.record_count().await?
            );
            ledger.close().await;
        }
        Commands::Schedule => {
            let Some(mut sched) = build_scheduler(&config).await? else {
                eprintln!("scheduler disabled; set PEND_SCHEDULER_ENABLED=true to enable it");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.import_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
