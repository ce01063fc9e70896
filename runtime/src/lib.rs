//! # Tally Runtime
//!
//! Micro-batch execution for the Tally aggregation engine.
//!
//! ## Core Components
//!
//! - **Aggregator**: drives fetch → apply → commit → publish batches on a trigger
//! - **Aggregate Store**: sharded per-merchant running totals
//! - **Checkpoint Coordinator**: atomic offsets + state commits and recovery
//! - **Sink Publisher**: keyed, idempotent downstream writes with carry-over
//!
//! ## Example
//!
//! ```ignore
//! use tally_runtime::{Aggregator, FileCheckpointStore, Trigger};
//!
//! let checkpoints = FileCheckpointStore::open("/var/lib/tally", 5).await?;
//! let mut aggregator = Aggregator::builder()
//!     .source(source)
//!     .sink(sink)
//!     .checkpoints(checkpoints)
//!     .trigger(Trigger::Interval(Duration::from_secs(1)))
//!     .recover()
//!     .await?;
//!
//! aggregator.run(shutdown).await?;
//! ```

/// Batch driver and its builder
pub mod aggregator;

/// Checkpoint protocol: recovery and atomic commits
pub mod coordinator;

/// Dead-letter routing to a log topic
pub mod dead_letter;

/// Parsing and applying records to the state store
pub mod engine;

/// Local-directory checkpoint storage
pub mod fs_checkpoint;

/// Health reporting
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Downstream publishing of aggregates
pub mod publisher;

/// Retry logic with exponential backoff
pub mod retry;

/// Sharded per-merchant aggregate state
pub mod store;

pub use aggregator::{Aggregator, AggregatorBuilder, AggregatorError, BatchSummary, Trigger};
pub use coordinator::{CheckpointCoordinator, CoordinatorError, Phase, Recovered};
pub use dead_letter::TopicDeadLetters;
pub use engine::{AggregationEngine, BatchOutcome, EngineError};
pub use fs_checkpoint::FileCheckpointStore;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{MetricsError, MetricsServer};
pub use publisher::{PublishReport, SinkPublisher};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use store::AggregateStore;
