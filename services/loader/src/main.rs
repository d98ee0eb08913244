//! Loader Service - Incremental load of delimited sales files into the
//! warehouse star schema.
//!
//! Responsibilities:
//! - Stream the source file in configurable chunks
//! - Normalize field names and textual values
//! - Validate rows against missing-value and outlier policies
//! - Optionally encrypt sensitive fields
//! - Deduplicate against composite keys already in the fact table
//! - Maintain customer/product dimensions with stable surrogate keys
//! - Insert fact rows referencing those surrogate keys
//!
//! Usage:
//!   cargo run --bin loader -- --config config/loader.json
//!   cargo run --bin loader -- --config config/loader.json --dry-run
//!
//! Exits 0 on completion (rejected and deduplicated rows included),
//! non-zero on configuration errors or an unrecoverable run error.
//! The summary is logged no matter how the run ends.

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod loader;
mod pipeline;
mod record;
mod warehouse;

use config::Config;
use loader::RunStats;
use warehouse::PgWarehouse;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads delimited sales files into the warehouse")]
struct Args {
    /// Path to the loader config file (JSON)
    #[arg(long)]
    config: String,

    /// Dry run - compute the full pipeline but don't write to the warehouse
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_path(&args.config)?;

    info!("=== Warehouse Loader ===");
    info!("Source file: {}", config.file.path);
    info!("Chunk size:  {}", config.file.chunksize);
    info!("Encryption:  {}", if config.encryption.encrypt { "on" } else { "off" });
    if args.dry_run {
        info!("Mode: dry-run (no warehouse writes)");
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;
    let warehouse = PgWarehouse::new(pool);

    let mut stats = RunStats::default();
    let result = loader::run(&config, &warehouse, args.dry_run, &mut stats).await;

    stats.log_summary();

    match result {
        Ok(()) => {
            info!("Load complete");
            Ok(())
        }
        Err(e) => {
            error!("Run aborted: {}", e);
            Err(e.into())
        }
    }
}
