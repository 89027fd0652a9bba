//! monstr runtime
//!
//! - Applies schema migrations
//! - Spawns one watcher per configured source
//! - Runs the aggregation scheduler
//! - Stops everything on CTRL+C, flushing watcher buffers first
//!
//! Usage:
//!   monstr --source node1:/var/log/storagenode.log --db ./data/monstr.db
//!   monstr --once   # single maintenance cycle, report printed as JSON
//!
//! Every setting can also come from `MONSTR_*` environment variables (or a
//! `.env` file); see `PipelineConfig::from_env`.

use clap::Parser;
use dotenv::dotenv;
use log::{error, info, warn};
use monstr::ingest::{build_line_source, SourceWatcher, UnprocessedSink, WatcherSettings};
use monstr::pipeline::{
    config::{parse_sources, PipelineConfig},
    db::{open_connection, run_schema_migrations, IngestSink, SqliteIngestWriter},
    PipelineScheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "monstr", version, about = "Storage-node log ingestion and transfer rollups")]
struct Cli {
    /// Log source as NAME:PATH or NAME:HOST:PORT (repeatable, replaces MONSTR_SOURCES)
    #[arg(long = "source", value_name = "NAME:SPEC")]
    sources: Vec<String>,

    /// SQLite database path (overrides MONSTR_DB_PATH)
    #[arg(long, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Run a single scheduler cycle, print its report as JSON and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env()?;
    if !cli.sources.is_empty() {
        config.sources = parse_sources(&cli.sources.join(","))?;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate()?;

    info!("🚀 monstr starting");
    info!("   ├─ Database: {}", config.db_path.display());
    info!("   ├─ Sources: {}", config.sources.len());
    info!("   ├─ Poll interval: {:?}, batch size: {}", config.poll_interval, config.batch_size);
    info!("   ├─ Grouping interval: {:?}", config.grouping_interval);
    info!("   └─ Unprocessed lines: {}", config.unprocessed_log_dir.display());

    info!("🔧 Initializing database...");
    let mut conn = open_connection(&config.db_path)?;
    run_schema_migrations(&mut conn)?;

    let mut scheduler = PipelineScheduler::new(
        conn,
        config.clock(),
        config.promotion_rules.clone(),
        config.retention,
        config.grouping_interval,
    )?;

    if cli.once {
        let report = scheduler.run_cycle();
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.errors.is_empty() {
            info!("✅ Single cycle finished");
        } else {
            warn!("⚠️  Single cycle finished with {} errors", report.errors.len());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();

    let sink: Arc<dyn IngestSink> = Arc::new(SqliteIngestWriter::new(&config.db_path)?);
    let unprocessed = UnprocessedSink::new(config.unprocessed_log_dir.clone());
    let settings = WatcherSettings::from_config(&config);

    if config.sources.is_empty() {
        warn!("⚠️  No log sources configured; only the scheduler will run");
    }

    let mut watchers = Vec::with_capacity(config.sources.len());
    for definition in &config.sources {
        info!("   ├─ Source {}", definition.describe());
        let watcher = SourceWatcher::new(
            definition.name.clone(),
            build_line_source(definition),
            sink.clone(),
            unprocessed.clone(),
            settings.clone(),
        );
        watchers.push(tokio::spawn(watcher.run(cancel.clone())));
    }

    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));

    info!("✅ {} watchers and the scheduler are running", watchers.len());
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }
    cancel.cancel();

    for handle in watchers {
        if let Err(e) = handle.await {
            error!("❌ Watcher task panicked: {}", e);
        }
    }
    if let Err(e) = scheduler_handle.await {
        error!("❌ Scheduler task panicked: {}", e);
    }

    info!("✅ monstr stopped");
    Ok(())
}
