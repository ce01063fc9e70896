//! `tally`: per-merchant transaction aggregation.
//!
//! Reads transaction events, keeps a running total and count per merchant, and
//! publishes changed aggregates after each checkpointed micro-batch. Configured via
//! `TALLY_*` environment variables (see `tally_service::config`).

use tally_service::config::Config;
use tally_service::{init_tracing, run, shutdown_signal};
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::from_env()?;
    info!(
        brokers = %config.redpanda.brokers,
        source_topic = %config.redpanda.source_topic,
        aggregates_topic = %config.redpanda.aggregates_topic,
        checkpoints = ?config.checkpoint.location,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested; finishing the current batch");
        let _ = shutdown_tx.send(true);
    });

    run(config, shutdown_rx).await?;
    info!("Shutdown complete");
    Ok(())
}
