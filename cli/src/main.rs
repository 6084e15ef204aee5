//! chainsync CLI — inspect and manage a ChainSync event store.
//!
//! # Commands
//! ```text
//! chainsync info
//! chainsync status --db ./chainsync.db
//! chainsync events --db ./chainsync.db --model network --limit 20
//! chainsync reset  --db ./chainsync.db [--yes]
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use chainsync_core::store::{EventQuery, EventStore};
use chainsync_core::types::fmt_height;
use chainsync_core::{ConsolePrompt, SyncConfig};
use chainsync_storage::SqliteEventStore;

mod logging;

use logging::{init_tracing, LogConfig};

#[derive(Parser)]
#[command(
    name = "chainsync",
    about = "Event-sourced blockchain sync — ChainSync CLI",
    long_about = "
ChainSync CLI: inspect and manage the event store behind a ChainSync engine.

ENVIRONMENT VARIABLES:
  CHAINSYNC_NETWORK_ID           Aggregate id of the network (default: network)
  CHAINSYNC_START_BLOCK_HEIGHT   First block to ingest (unset = follow the tip)
  CHAINSYNC_MAX_BLOCK_HEIGHT     Highest block accepted
  CHAINSYNC_WINDOW_SIZE          Blocks retained for fork walks
  CHAINSYNC_SNAPSHOT_INTERVAL    Events between snapshots (0 = off)
",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Info,

    /// Show the network height and every aggregate's version and height
    Status {
        /// Path to the SQLite event store
        #[arg(long)]
        db: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored events of one aggregate
    Events {
        /// Path to the SQLite event store
        #[arg(long)]
        db: String,
        /// Aggregate id (a read model id, or the network id)
        #[arg(long)]
        model: String,
        /// Only events at or below this block height
        #[arg(long)]
        height: Option<u64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete every stored event
    Reset {
        /// Path to the SQLite event store
        #[arg(long)]
        db: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&LogConfig {
        level: cli.log_level.clone(),
        json: cli.log_json,
        ..Default::default()
    });

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Status { db, json } => cmd_status(&db, json).await,
        Commands::Events {
            db,
            model,
            height,
            limit,
            offset,
            json,
        } => cmd_events(&db, &model, height, limit, offset, json).await,
        Commands::Reset { db, yes } => cmd_reset(&db, yes).await,
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn open(db: &str) -> Result<SqliteEventStore> {
    SqliteEventStore::open(db)
        .await
        .with_context(|| format!("failed to open event store '{db}'"))
}

fn cmd_info() -> Result<()> {
    let config = SyncConfig::from_env().context("invalid CHAINSYNC_* configuration")?;
    println!("ChainSync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Network id:         {}", config.network_id);
    println!("  Start block height: {}", fmt_height(config.start_height));
    println!("  Max block height:   {}", fmt_height(config.max_block_height));
    println!("  Window size:        {} blocks", config.window_size);
    println!("  Snapshot interval:  {} events", config.snapshot_interval);
    println!("  Event bus capacity: {}", config.event_channel_capacity);
    println!(
        "  Saga retries:       {} (backoff {}ms → {}ms, x{})",
        config.retry.max_retries,
        config.retry.initial_backoff_ms,
        config.retry.max_backoff_ms,
        config.retry.multiplier
    );
    println!("  Storage backends:   memory, SQLite (feature: sqlite)");
    Ok(())
}

async fn cmd_status(db: &str, as_json: bool) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = open(db).await?;
    let aggregates = store.aggregates().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&aggregates)?);
        return Ok(());
    }

    let network = aggregates.iter().find(|a| a.aggregate_id == config.network_id);
    println!(
        "Network '{}': height {}",
        config.network_id,
        fmt_height(network.and_then(|n| n.block_height))
    );
    if aggregates.is_empty() {
        println!("  (no events)");
    }
    for info in &aggregates {
        println!(
            "  {:<32} v{:<8} height {}",
            info.aggregate_id,
            info.version,
            fmt_height(info.block_height)
        );
    }
    Ok(())
}

async fn cmd_events(
    db: &str,
    model: &str,
    height: Option<u64>,
    limit: usize,
    offset: usize,
    as_json: bool,
) -> Result<()> {
    let store = open(db).await?;
    let mut query = EventQuery::aggregate(model).page(limit, offset);
    query.max_height = height;
    let events = store.fetch_events(&query).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    if events.is_empty() {
        println!("No events for '{model}'");
        return Ok(());
    }
    for e in &events {
        println!(
            "v{:<6} {:<8} {:<16} {} {}",
            e.version,
            fmt_height(e.block_height),
            e.event_type,
            e.request_id,
            e.payload
        );
    }
    Ok(())
}

async fn cmd_reset(db: &str, yes: bool) -> Result<()> {
    let store = open(db).await?;
    let ids: Vec<String> = store
        .aggregates()
        .await?
        .into_iter()
        .map(|a| a.aggregate_id)
        .collect();

    if ids.is_empty() {
        println!("Nothing to reset");
        return Ok(());
    }
    if !yes
        && !ConsolePrompt::ask_console(&format!(
            "Delete all events of {} aggregate(s) in '{db}'?",
            ids.len()
        ))
    {
        println!("Reset cancelled");
        return Ok(());
    }

    store.rollback(&ids, None, Vec::new()).await?;
    tracing::warn!(db, aggregates = ids.len(), "Event store reset");
    println!("Deleted all events of {} aggregate(s)", ids.len());
    Ok(())
}
