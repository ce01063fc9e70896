//! Prometheus metrics for the aggregation pipeline.
//!
//! Recorders are zero-sized structs grouped by concern. They write through the
//! `metrics` facade, so they are no-ops until a recorder is installed, which is what
//! tests rely on.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to configure the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter or bind its listener
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
///
/// Installs the global recorder and serves `/metrics` on `addr` from a background
/// task owned by the exporter. Must be started from within a Tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a server for `addr`; nothing is bound until [`MetricsServer::start`].
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Whether the exporter has been installed by this server.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Address the endpoint is served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe all metrics, install the exporter and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be configured, a recorder is
    /// already installed, or the address cannot be bound.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        describe_metrics();
        self.started = true;
        tracing::info!(addr = %self.addr, "Metrics endpoint listening");
        Ok(())
    }
}

fn describe_metrics() {
    describe_counter!("tally_batches_total", "Micro-batches executed");
    describe_counter!("tally_records_fetched_total", "Records fetched from the source log");
    describe_counter!("tally_events_applied_total", "Events applied to aggregates");
    describe_counter!(
        "tally_records_rejected_total",
        "Records routed to the dead-letter path, by kind"
    );
    describe_histogram!("tally_batch_duration_seconds", "Wall time of one micro-batch");
    describe_gauge!("tally_state_merchants", "Merchants held in the state store");

    describe_counter!("tally_checkpoints_committed_total", "Checkpoints made durable");
    describe_counter!("tally_checkpoint_failures_total", "Checkpoint commits that failed");
    describe_histogram!(
        "tally_checkpoint_commit_duration_seconds",
        "Time to persist a checkpoint, including retries"
    );

    describe_counter!("tally_aggregates_published_total", "Aggregates written downstream");
    describe_counter!("tally_publish_failures_total", "Aggregates left pending after retries");
    describe_gauge!("tally_pending_publishes", "Aggregates awaiting downstream confirmation");

    describe_counter!("tally_retry_attempts_total", "Retries scheduled, by operation");
    describe_counter!("tally_retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("tally_retry_exhausted_total", "Operations that ran out of retries");
}

/// Micro-batch and state store metrics.
pub struct BatchMetrics;

impl BatchMetrics {
    /// Record a finished batch.
    pub fn record_batch(fetched: usize, applied: usize, duration: Duration) {
        counter!("tally_batches_total").increment(1);
        counter!("tally_records_fetched_total").increment(fetched as u64);
        counter!("tally_events_applied_total").increment(applied as u64);
        histogram!("tally_batch_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a record routed to the dead-letter path.
    pub fn record_rejected(kind: &'static str) {
        counter!("tally_records_rejected_total", "kind" => kind).increment(1);
    }

    /// Record the current number of merchants in the store.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_merchants(count: usize) {
        gauge!("tally_state_merchants").set(count as f64);
    }
}

/// Checkpoint metrics.
pub struct CheckpointMetrics;

impl CheckpointMetrics {
    /// Record a committed checkpoint.
    pub fn record_commit(duration: Duration) {
        counter!("tally_checkpoints_committed_total").increment(1);
        histogram!("tally_checkpoint_commit_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a commit that failed after retries.
    pub fn record_failure() {
        counter!("tally_checkpoint_failures_total").increment(1);
    }
}

/// Downstream publishing metrics.
pub struct PublishMetrics;

impl PublishMetrics {
    /// Record a confirmed write.
    pub fn record_published() {
        counter!("tally_aggregates_published_total").increment(1);
    }

    /// Record a write left pending.
    pub fn record_failure() {
        counter!("tally_publish_failures_total").increment(1);
    }

    /// Record the size of the pending set.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_pending(count: usize) {
        gauge!("tally_pending_publishes").set(count as f64);
    }
}

/// Retry metrics, labelled by operation.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a scheduled retry.
    pub fn record_attempt(operation: &'static str) {
        counter!("tally_retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record success after at least one retry.
    pub fn record_success(operation: &'static str) {
        counter!("tally_retry_successes_total", "operation" => operation).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(operation: &'static str) {
        counter!("tally_retry_exhausted_total", "operation" => operation).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_server_is_not_started() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(!server.is_started());
        assert_eq!(server.addr().ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn recorders_are_noops_without_exporter() {
        BatchMetrics::record_batch(10, 8, Duration::from_millis(5));
        BatchMetrics::record_rejected("malformed");
        BatchMetrics::record_merchants(3);
        CheckpointMetrics::record_commit(Duration::from_millis(2));
        PublishMetrics::record_pending(1);
        RetryMetrics::record_attempt("fetch");
    }
}
