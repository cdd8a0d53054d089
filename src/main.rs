//! Hitstats - runs the persist, session and retention loops for a
//! statistics database until interrupted.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use hitstats::config::Config;
use hitstats::cron::Scheduler;
use hitstats::db::{Database, Memstore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting hitstats...");

    let db = Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!(url = %config.database.url, "Database initialized");

    let memstore = Arc::new(Memstore::new(&config.memstore));
    let scheduler = Scheduler::new(db, memstore, config, CancellationToken::new());
    let handles = scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.shutdown(handles).await?;
    info!("Stopped");
    Ok(())
}
