//! binlake - MySQL binlog to Apache Doris
//!
//! ```bash
//! # Snapshot the configured tables, then stream until Ctrl+C
//! binlake -c binlake.yaml
//!
//! # Validate configuration
//! binlake -c binlake.yaml validate
//!
//! # Show per-table progress
//! binlake -c binlake.yaml checkpoints
//!
//! # Accept a schema change the warehouse was altered for by hand
//! binlake -c binlake.yaml resolve --table shop.orders --position mysql-bin.000004:1200:1:0
//! ```

use anyhow::{Context, Result};
use binlake_cdc::{
    CheckpointBackend, CheckpointStore, LogPosition, MySqlConnector, MySqlSnapshotSource, TableId,
};
use binlake_connect::config::{BinlakeConfig, DestinationKind, LogFormat, LoggingConfig};
use binlake_connect::{
    DorisConfig, DorisDestination, MemoryDestination, Pipeline, PipelineSource, SharedDestination,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "binlake")]
#[command(version, about = "Change data capture from MySQL binlog into Apache Doris")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "binlake.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot and stream the configured tables (default)
    Run,
    /// Validate configuration file
    Validate,
    /// List per-table checkpoints
    Checkpoints,
    /// Accept a paused schema change; the table resumes past it on the next run
    Resolve {
        /// Source table as db.table
        #[arg(long)]
        table: String,
        /// Position of the schema change, as printed when the table paused
        #[arg(long)]
        position: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BinlakeConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    init_logging(cli.verbose, &config.logging);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(&config),
        Commands::Checkpoints => list_checkpoints(&config).await,
        Commands::Resolve { table, position } => resolve(&config, &table, &position).await,
    }
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init(),
    }
}

async fn run(config: BinlakeConfig) -> Result<()> {
    let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    info!(run_id = %run_id, tables = config.source.tables.len(), "Starting binlake");

    let pipeline_config = config.pipeline_config(&run_id)?;
    let checkpoints = CheckpointStore::new(&config.checkpoint.dir)
        .await
        .with_context(|| format!("Failed to open checkpoint dir {}", config.checkpoint.dir.display()))?;

    let mysql = config.mysql_config();
    let snapshot = MySqlSnapshotSource::connect(
        &mysql.url(),
        config.source_tables()?,
        config.server_time_zone()?,
    )?;
    let source = PipelineSource::new(
        Arc::new(MySqlConnector::new(mysql)),
        Arc::new(snapshot),
    );

    let destination: SharedDestination = match config.destination.kind {
        DestinationKind::Doris => Arc::new(DorisDestination::new(DorisConfig::from(&config))?),
        DestinationKind::Memory => {
            warn!("Loading into the in-memory destination; nothing is persisted");
            Arc::new(MemoryDestination::new())
        }
    };

    let pipeline = Pipeline::new(pipeline_config, source, destination, Arc::new(checkpoints));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
            signal.cancel();
        }
    });

    let report = pipeline.run(shutdown).await?;

    for table in &report.tables {
        info!(
            table = %table.source,
            destination = %table.table,
            status = %table.status,
            batches = table.stats.batches,
            events = table.stats.events,
            committed = ?table.checkpoint.committed.as_ref().map(ToString::to_string),
            "Table summary"
        );
        if let Some(e) = &table.load_error {
            error!(table = %e.table, label = %e.label, position = %e.first, "{}", e);
        }
    }
    if let Some(e) = &report.source_error {
        error!(error = %e, "Source stopped the pipeline");
    }

    if report.needs_attention() {
        let count = report
            .tables
            .iter()
            .filter(|t| t.status.needs_attention())
            .count();
        anyhow::bail!(
            "{} table(s) need attention{}",
            count,
            if report.source_error.is_some() { " and the source failed" } else { "" }
        );
    }
    info!("binlake stopped");
    Ok(())
}

fn validate_config(config: &BinlakeConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Source:");
    println!("  MySQL: {}:{}", config.source.host, config.source.port);
    println!("  Server id: {}", config.source.server_id);
    println!("  Startup: {}", config.startup_mode()?);
    println!("  Time zone: {}", config.server_time_zone()?);
    println!();

    println!("Tables:");
    for mapping in config.table_mappings()? {
        println!("  {} → {}", mapping.source, mapping.destination);
    }
    println!();

    println!("Destination:");
    match config.destination.kind {
        DestinationKind::Doris => {
            println!("  Doris FE nodes:");
            for node in &config.destination.fe_nodes {
                println!("    - {}", node);
            }
            println!("  User: {}", config.destination.user);
        }
        DestinationKind::Memory => println!("  In-memory (dry run)"),
    }
    println!();

    println!("Loader:");
    println!(
        "  Batch: {} events / {} bytes / {}ms",
        config.loader.batch_max_events, config.loader.batch_max_bytes, config.loader.batch_max_delay_ms
    );
    println!("  Label prefix: {}", config.loader.label_prefix);
    println!("  Max retries: {}", config.loader.max_retries);
    println!("  Concurrent loads: {}", config.loader.max_concurrent_loads);
    println!("  Checkpoints: {}", config.checkpoint.dir.display());
    Ok(())
}

async fn list_checkpoints(config: &BinlakeConfig) -> Result<()> {
    let store = CheckpointStore::new(&config.checkpoint.dir).await?;
    for table in config.source_tables()? {
        match store.load_table(&table).await? {
            Some(cp) => {
                println!("{}", table);
                println!("  phase: {:?}", cp.phase);
                if let Some(w) = &cp.watermark {
                    println!("  watermark: {}", w);
                }
                if let Some(c) = &cp.committed {
                    println!("  committed: {}", c);
                }
                if let Some(p) = &cp.pending {
                    println!("  pending: {} ({}..{}, {} events)", p.label, p.first, p.last, p.events);
                }
                if let Some(p) = &cp.paused {
                    println!("  paused at {}: {}", p.position, p.detail);
                }
                for r in &cp.resolved {
                    println!("  resolved: {}", r);
                }
                println!("  updated: {}", cp.updated_at);
            }
            None => println!("{}\n  no checkpoint", table),
        }
    }
    Ok(())
}

async fn resolve(config: &BinlakeConfig, table: &str, position: &str) -> Result<()> {
    let table: TableId = table.parse()?;
    let position: LogPosition = position.parse()?;
    let store = CheckpointStore::new(&config.checkpoint.dir).await?;
    let mut checkpoint = store
        .load_table(&table)
        .await?
        .with_context(|| format!("no checkpoint for {}", table))?;

    match &checkpoint.paused {
        Some(p) if p.position == position => {}
        Some(p) => warn!(
            table = %table,
            paused_at = %p.position,
            "Resolving a position other than the one the table paused at"
        ),
        None => warn!(table = %table, "Table is not paused"),
    }
    checkpoint.resolve(position.clone());
    store.save_table(&checkpoint).await?;
    println!("✓ {} resolved at {}; the next run applies changes after it", table, position);
    Ok(())
}
