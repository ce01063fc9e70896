//! Wiring for the `tally` binary.
//!
//! Connects the Kafka-compatible source and sink, opens checkpoint storage, recovers
//! the aggregator and drives it until a shutdown signal arrives. An in-flight batch
//! always finishes (and commits) before the process exits.

pub mod config;

use anyhow::Context;
use config::{CheckpointLocation, Config};
use std::sync::Arc;
use std::time::Duration;
use tally_core::{CheckpointStore, SinkLog};
use tally_postgres::PostgresCheckpointStore;
use tally_redpanda::{RedpandaSink, RedpandaSource};
use tally_runtime::{
    Aggregator, FileCheckpointStore, MetricsServer, RetryPolicy, TopicDeadLetters,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "tally=info,tally_runtime=info,tally_redpanda=info,tally_postgres=info";

/// Install the global `tracing` subscriber (`RUST_LOG` overrides the default filter).
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn sink(config: &Config, topic: &str) -> anyhow::Result<RedpandaSink> {
    RedpandaSink::builder()
        .brokers(&config.redpanda.brokers)
        .topic(topic)
        .producer_acks(&config.redpanda.producer_acks)
        .compression(&config.redpanda.compression)
        .build()
        .with_context(|| format!("Failed to create producer for topic {topic}"))
}

async fn checkpoint_store(config: &Config) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let retain = config.checkpoint.retain;
    match &config.checkpoint.location {
        CheckpointLocation::Directory(dir) => {
            info!(dir = %dir.display(), retain, "Using filesystem checkpoints");
            let store = FileCheckpointStore::open(dir.clone(), retain)
                .await
                .with_context(|| format!("Failed to open checkpoint directory {}", dir.display()))?;
            Ok(Arc::new(store))
        }
        CheckpointLocation::Postgres(url) => {
            info!(pipeline = %config.checkpoint.pipeline, retain, "Using PostgreSQL checkpoints");
            let store = PostgresCheckpointStore::connect(url, config.checkpoint.pipeline.as_str())
                .await
                .context("Failed to connect to checkpoint database")?
                .with_retain(i64::try_from(retain).unwrap_or(i64::MAX));
            store
                .migrate()
                .await
                .context("Failed to migrate checkpoint database")?;
            Ok(Arc::new(store))
        }
    }
}

/// Build every collaborator from `config` and recover the aggregator.
///
/// # Errors
///
/// Fails if a client cannot be created, checkpoint storage is unreachable, the
/// latest checkpoint is corrupt, or the source topic has no partitions.
pub async fn build_aggregator(config: &Config) -> anyhow::Result<Aggregator> {
    let source = RedpandaSource::builder()
        .brokers(&config.redpanda.brokers)
        .topic(&config.redpanda.source_topic)
        .consumer_group(&config.redpanda.consumer_group)
        .starting_offsets(config.redpanda.starting_offsets)
        .fetch_timeout(config.redpanda.fetch_timeout)
        .build()
        .context("Failed to create source consumer")?;
    let aggregates: Arc<dyn SinkLog> = Arc::new(sink(config, &config.redpanda.aggregates_topic)?);

    let tuning = &config.aggregator;
    let mut builder = Aggregator::builder()
        .source(source)
        .shared_sink(aggregates)
        .shared_checkpoints(checkpoint_store(config).await?)
        .trigger(tuning.trigger)
        .state_shards(tuning.state_shards)
        .max_records_per_partition(tuning.max_records_per_partition)
        .fetch_retry(RetryPolicy::builder().max_retries(5).jitter(true).build())
        .commit_retry(
            RetryPolicy::builder()
                .max_retries(tuning.commit_max_retries)
                .max_delay(Duration::from_secs(10))
                .build(),
        )
        .publish_retry(
            RetryPolicy::builder()
                .max_retries(tuning.publish_max_retries)
                .jitter(true)
                .build(),
        );

    if let Some(topic) = &config.redpanda.anomalies_topic {
        info!(topic = %topic, "Routing skipped records to anomalies topic");
        builder = builder.dead_letters(TopicDeadLetters::new(Arc::new(sink(config, topic)?)));
    }

    builder.recover().await.context("Recovery failed")
}

/// Run the aggregator until `shutdown` flips to `true`.
///
/// # Errors
///
/// Fails on startup errors and on fatal aggregator errors (a checkpoint that could
/// not be committed, corrupt state, a crashed worker).
pub async fn run(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("Failed to start metrics endpoint")?;
    }

    let mut aggregator = build_aggregator(&config).await?;
    info!(
        version = aggregator.version(),
        partitions = ?aggregator.partitions(),
        merchants = aggregator.store().len(),
        pending_publish = aggregator.pending_publish().len(),
        "Aggregator recovered"
    );

    let result = aggregator.run(shutdown).await;
    let health = aggregator.health();
    info!(status = %health.status, version = aggregator.version(), "Final health");
    result.context("Aggregator halted")
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
