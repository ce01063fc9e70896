//! The micro-batch driver.
//!
//! One batch:
//!
//! 1. fetch every partition concurrently from its tracked position
//! 2. parse and apply records, one worker per partition
//! 3. advance offsets
//! 4. commit offsets, state and the pending-publish set as one checkpoint
//! 5. publish changed and previously unconfirmed aggregates
//!
//! A fetch failure aborts the batch before anything is applied. A failed commit is
//! fatal: the aggregator stops, and on restart recovery rolls state and offsets back
//! to the last durable checkpoint, so the uncommitted batch is re-read and re-applied
//! exactly once. A crashed partition worker is fatal for the same reason: the store
//! may hold part of the batch, so the aggregator refuses further batches until it is
//! restarted and recovered. Aggregates are published only after the checkpoint that contains
//! them is durable, and the checkpoint records which ones still need publishing.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut aggregator = Aggregator::builder()
//!     .source(source)
//!     .sink(sink)
//!     .checkpoints(checkpoints)
//!     .trigger(Trigger::Interval(Duration::from_secs(1)))
//!     .recover()
//!     .await?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! aggregator.run(shutdown_rx).await?;
//! ```

use crate::coordinator::{CheckpointCoordinator, CoordinatorError, Phase};
use crate::engine::{AggregationEngine, EngineError};
use crate::health::HealthCheck;
use crate::metrics::BatchMetrics;
use crate::publisher::{PUBLISH_CONCURRENCY, PublishReport, SinkPublisher};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{AggregateStore, DEFAULT_SHARDS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tally_core::{
    CheckpointError, CheckpointStore, DeadLetterSink, DiscardDeadLetters, MerchantId,
    OffsetTracker, PartitionId, SinkLog, SourceLog, SourceRecord, TransportError,
};
use thiserror::Error;
use tokio::sync::watch;

/// Default cap on records read from one partition per batch.
pub const DEFAULT_MAX_RECORDS_PER_PARTITION: usize = 10_000;

/// When the next batch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Start batches at a fixed cadence; a batch that overruns is followed
    /// immediately by the next one
    Interval(Duration),
    /// Start the next batch as soon as the previous one finishes, waiting `idle`
    /// after a batch that read nothing
    Continuous {
        /// Back-off after an empty batch
        idle: Duration,
    },
}

impl Default for Trigger {
    fn default() -> Self {
        Self::Continuous {
            idle: Duration::from_millis(500),
        }
    }
}

/// Errors from the aggregator.
#[derive(Error, Debug)]
pub enum AggregatorError {
    /// The aggregator was built without a required collaborator
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A transport failed after retries; the batch was abandoned before any state
    /// changed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A checkpoint could not be committed, or checkpoint storage is unreachable
    #[error("Checkpoint failure: {0}")]
    Checkpoint(CoordinatorError),

    /// The latest checkpoint cannot be decoded
    #[error("State corruption: {0}")]
    StateCorruption(CheckpointError),

    /// A partition worker failed mid-batch
    #[error(transparent)]
    Worker(#[from] EngineError),

    /// An earlier fatal error left state that must not be built upon
    #[error("Aggregator halted: {0}")]
    Halted(String),
}

impl AggregatorError {
    /// Whether the aggregator must stop. Only transport failures are transient.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

impl From<CoordinatorError> for AggregatorError {
    fn from(error: CoordinatorError) -> Self {
        match error {
            CoordinatorError::Storage(corrupt @ CheckpointError::Corrupt { .. }) => {
                Self::StateCorruption(corrupt)
            }
            other => Self::Checkpoint(other),
        }
    }
}

/// What one batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Version committed by this batch, if it committed
    pub committed_version: Option<u64>,
    /// Records read (after dropping redelivered ones)
    pub fetched: usize,
    /// Events applied
    pub applied: usize,
    /// Records routed to the dead-letter path
    pub rejected: usize,
    /// Merchants whose aggregate changed
    pub changed: Vec<MerchantId>,
    /// Outcome of publishing
    pub publish: PublishReport,
    /// Wall time of the batch
    pub duration: Duration,
}

impl BatchSummary {
    /// Whether the batch read no records.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}

/// Builder for [`Aggregator`].
pub struct AggregatorBuilder {
    source: Option<Arc<dyn SourceLog>>,
    sink: Option<Arc<dyn SinkLog>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    trigger: Trigger,
    max_records_per_partition: usize,
    state_shards: usize,
    fetch_policy: RetryPolicy,
    commit_policy: RetryPolicy,
    publish_policy: RetryPolicy,
    publish_concurrency: usize,
}

impl Default for AggregatorBuilder {
    fn default() -> Self {
        Self {
            source: None,
            sink: None,
            checkpoints: None,
            dead_letters: Arc::new(DiscardDeadLetters),
            trigger: Trigger::default(),
            max_records_per_partition: DEFAULT_MAX_RECORDS_PER_PARTITION,
            state_shards: DEFAULT_SHARDS,
            fetch_policy: RetryPolicy::default(),
            commit_policy: RetryPolicy::default(),
            publish_policy: RetryPolicy::default(),
            publish_concurrency: PUBLISH_CONCURRENCY,
        }
    }
}

impl AggregatorBuilder {
    /// Source of transaction records.
    #[must_use]
    pub fn source(self, source: impl SourceLog + 'static) -> Self {
        self.shared_source(Arc::new(source))
    }

    /// Source of transaction records, already shared.
    #[must_use]
    pub fn shared_source(mut self, source: Arc<dyn SourceLog>) -> Self {
        self.source = Some(source);
        self
    }

    /// Downstream log for aggregates.
    #[must_use]
    pub fn sink(self, sink: impl SinkLog + 'static) -> Self {
        self.shared_sink(Arc::new(sink))
    }

    /// Downstream log for aggregates, already shared.
    #[must_use]
    pub fn shared_sink(mut self, sink: Arc<dyn SinkLog>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Checkpoint storage.
    #[must_use]
    pub fn checkpoints(self, checkpoints: impl CheckpointStore + 'static) -> Self {
        self.shared_checkpoints(Arc::new(checkpoints))
    }

    /// Checkpoint storage, already shared.
    #[must_use]
    pub fn shared_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Destination for skipped records (default: log and discard).
    #[must_use]
    pub fn dead_letters(mut self, dead_letters: impl DeadLetterSink + 'static) -> Self {
        self.dead_letters = Arc::new(dead_letters);
        self
    }

    /// Batch trigger.
    #[must_use]
    pub const fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Cap on records read from one partition per batch (at least one).
    #[must_use]
    pub fn max_records_per_partition(mut self, max: usize) -> Self {
        self.max_records_per_partition = max.max(1);
        self
    }

    /// Number of state store shards.
    #[must_use]
    pub const fn state_shards(mut self, shards: usize) -> Self {
        self.state_shards = shards;
        self
    }

    /// Retry policy for fetches and partition discovery.
    #[must_use]
    pub fn fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    /// Retry policy for checkpoint commits.
    #[must_use]
    pub fn commit_retry(mut self, policy: RetryPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    /// Retry policy for each downstream write.
    #[must_use]
    pub fn publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_policy = policy;
        self
    }

    /// Concurrent downstream writes.
    #[must_use]
    pub const fn publish_concurrency(mut self, concurrency: usize) -> Self {
        self.publish_concurrency = concurrency;
        self
    }

    /// Recover from the latest checkpoint and discover source partitions.
    ///
    /// # Errors
    ///
    /// - [`AggregatorError::Configuration`] if a collaborator is missing
    /// - [`AggregatorError::StateCorruption`] if the latest checkpoint is unreadable
    /// - [`AggregatorError::Checkpoint`] if checkpoint storage is unreachable
    /// - [`AggregatorError::Transport`] if partitions cannot be discovered
    pub async fn recover(self) -> Result<Aggregator, AggregatorError> {
        let source = self
            .source
            .ok_or_else(|| AggregatorError::Configuration("source log is required".into()))?;
        let sink = self
            .sink
            .ok_or_else(|| AggregatorError::Configuration("sink log is required".into()))?;
        let checkpoints = self.checkpoints.ok_or_else(|| {
            AggregatorError::Configuration("checkpoint store is required".into())
        })?;

        let store = Arc::new(AggregateStore::with_shards(self.state_shards));
        let mut tracker = OffsetTracker::new();
        let mut coordinator = CheckpointCoordinator::new(checkpoints, self.commit_policy);
        let recovered = coordinator.recover(&mut tracker, &store).await?;

        let mut partitions =
            retry_with_backoff(&self.fetch_policy, "partition_discovery", || source.partitions())
                .await?;
        partitions.sort_unstable();
        partitions.dedup();

        let mut publisher = SinkPublisher::new(sink, self.publish_policy)
            .with_concurrency(self.publish_concurrency);
        publisher.enqueue(recovered.pending_publish);

        BatchMetrics::record_merchants(store.len());
        tracing::info!(
            version = recovered.version,
            partitions = ?partitions,
            merchants = store.len(),
            pending_publish = publisher.pending().len(),
            "Aggregator ready"
        );

        Ok(Aggregator {
            source,
            engine: AggregationEngine::new(store, self.dead_letters),
            coordinator,
            publisher,
            tracker,
            partitions,
            trigger: self.trigger,
            max_records_per_partition: self.max_records_per_partition,
            fetch_policy: self.fetch_policy,
            halted: None,
        })
    }
}

struct PartitionFetch {
    partition: PartitionId,
    records: Vec<SourceRecord>,
    next_position: Option<i64>,
}

/// A recovered, running aggregation pipeline.
pub struct Aggregator {
    source: Arc<dyn SourceLog>,
    engine: AggregationEngine,
    coordinator: CheckpointCoordinator,
    publisher: SinkPublisher,
    tracker: OffsetTracker,
    partitions: Vec<PartitionId>,
    trigger: Trigger,
    max_records_per_partition: usize,
    fetch_policy: RetryPolicy,
    halted: Option<String>,
}

impl Aggregator {
    /// Start building an aggregator.
    #[must_use]
    pub fn builder() -> AggregatorBuilder {
        AggregatorBuilder::default()
    }

    /// Version of the last durable checkpoint.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.coordinator.version()
    }

    /// Checkpoint coordinator phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    /// Source partitions being consumed.
    #[must_use]
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// Per-partition read positions.
    #[must_use]
    pub const fn offsets(&self) -> &OffsetTracker {
        &self.tracker
    }

    /// The aggregate state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<AggregateStore> {
        self.engine.store()
    }

    /// Merchants whose latest aggregate is not yet confirmed downstream.
    #[must_use]
    pub fn pending_publish(&self) -> Vec<MerchantId> {
        self.publisher.pending()
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let pending = self.publisher.pending().len();
        let check = if self.coordinator.is_halted() {
            HealthCheck::unhealthy("aggregator", "checkpoint commit failed; restart required")
        } else if let Some(reason) = &self.halted {
            HealthCheck::unhealthy("aggregator", format!("{reason}; restart required"))
        } else if pending > 0 {
            HealthCheck::degraded("aggregator", format!("{pending} aggregates awaiting publish"))
        } else {
            HealthCheck::healthy("aggregator")
        };
        check
            .with_metadata("version", self.version())
            .with_metadata("merchants", self.store().len())
            .with_metadata("pending_publishes", pending)
    }

    /// Re-publish every aggregate, e.g. after the downstream topic was recreated.
    pub async fn republish_all(&mut self) -> PublishReport {
        self.publisher.republish_all(self.engine.store()).await
    }

    /// Run one micro-batch.
    ///
    /// # Errors
    ///
    /// Returns [`AggregatorError::Transport`] if a partition cannot be read (no state
    /// changed; the batch can simply be retried), and a fatal error if a worker fails
    /// or the checkpoint cannot be committed. After a worker failure every later call
    /// returns [`AggregatorError::Halted`].
    pub async fn run_batch(&mut self) -> Result<BatchSummary, AggregatorError> {
        if let Some(reason) = &self.halted {
            return Err(AggregatorError::Halted(reason.clone()));
        }
        if self.coordinator.is_halted() {
            return Err(AggregatorError::Checkpoint(CoordinatorError::InvalidPhase {
                operation: "run a batch",
                phase: self.coordinator.phase(),
            }));
        }
        let started = Instant::now();

        let fetches = futures::future::try_join_all(
            self.partitions.iter().map(|&partition| self.fetch_partition(partition)),
        )
        .await?;
        let fetched: usize = fetches.iter().map(|f| f.records.len()).sum();

        let mark = self.coordinator.next_mark();
        let mut positions = Vec::with_capacity(fetches.len());
        let mut records = Vec::with_capacity(fetches.len());
        for fetch in fetches {
            positions.push((fetch.partition, fetch.next_position));
            records.push(fetch.records);
        }
        let outcome = match self.engine.ingest_partitions(records, mark).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    version = self.version(),
                    "Batch partially applied; refusing further batches"
                );
                self.halted = Some(e.to_string());
                return Err(e.into());
            }
        };

        let mut moved = false;
        for (partition, next) in positions {
            if let Some(next) = next {
                moved |= self.tracker.advance(partition, next);
            }
        }

        let committed_version = if fetched > 0 || moved {
            self.publisher.enqueue(outcome.changed.iter().cloned());
            let version = self
                .coordinator
                .commit(&self.tracker, self.engine.store(), self.publisher.pending())
                .await?;
            Some(version)
        } else {
            None
        };

        let publish = if self.publisher.pending().is_empty() {
            PublishReport::default()
        } else {
            self.publisher.flush(self.engine.store()).await
        };

        let duration = started.elapsed();
        BatchMetrics::record_batch(fetched, outcome.applied, duration);
        BatchMetrics::record_merchants(self.engine.store().len());

        let summary = BatchSummary {
            committed_version,
            fetched,
            applied: outcome.applied,
            rejected: outcome.anomalies.len(),
            changed: outcome.changed.into_iter().collect(),
            publish,
            duration,
        };
        if summary.is_idle() {
            tracing::trace!("Empty batch");
        } else {
            tracing::info!(
                version = ?summary.committed_version,
                fetched = summary.fetched,
                applied = summary.applied,
                rejected = summary.rejected,
                changed = summary.changed.len(),
                published = summary.publish.published.len(),
                publish_failed = summary.publish.failed.len(),
                duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                "Batch complete"
            );
        }
        Ok(summary)
    }

    async fn fetch_partition(&self, partition: PartitionId) -> Result<PartitionFetch, TransportError> {
        let from = self.tracker.position(partition);
        let batch = retry_with_backoff(&self.fetch_policy, "fetch", || {
            self.source.fetch(partition, from, self.max_records_per_partition)
        })
        .await?;

        let received = batch.records.len();
        let records: Vec<SourceRecord> = batch
            .records
            .into_iter()
            .filter(|record| from.is_none_or(|position| record.offset >= position))
            .collect();
        if records.len() < received {
            tracing::debug!(
                partition,
                dropped = received - records.len(),
                "Dropped redelivered records"
            );
        }

        let after_last = records.last().map(|record| record.offset + 1);
        let next_position = match (batch.next_position, after_last) {
            (Some(reported), Some(last)) => Some(reported.max(last)),
            (reported, last) => reported.or(last),
        };

        Ok(PartitionFetch {
            partition,
            records,
            next_position,
        })
    }

    /// Run batches on the configured [`Trigger`] until `shutdown` turns `true` or its
    /// sender is dropped.
    ///
    /// Shutdown is only observed between batches: an in-flight batch always finishes
    /// and commits. Transport failures are logged and the batch retried on the next
    /// trigger.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`AggregatorError`].
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AggregatorError> {
        tracing::info!(trigger = ?self.trigger, version = self.version(), "Aggregator started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let idle = match self.run_batch().await {
                Ok(summary) => summary.is_idle(),
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, version = self.version(), "Aggregator halted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Batch abandoned, will retry");
                    true
                }
            };

            let delay = match self.trigger {
                Trigger::Interval(interval) => interval.saturating_sub(started.elapsed()),
                Trigger::Continuous { idle: backoff } if idle => backoff,
                Trigger::Continuous { .. } => Duration::ZERO,
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(version = self.version(), "Aggregator stopped");
        Ok(())
    }
}
