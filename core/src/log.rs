//! Partitioned log abstractions for the source and downstream transports.
//!
//! The engine reads raw transaction records from a [`SourceLog`] and writes updated
//! aggregates to a [`SinkLog`]. Both are external collaborators: broker clustering,
//! partition assignment and replication live behind these traits.
//!
//! # Delivery Semantics
//!
//! - **Source**: at-least-once, ordered within a partition, no ordering across
//!   partitions. The engine never relies on broker-side consumer offsets; positions
//!   are tracked by the engine and persisted in checkpoints.
//! - **Sink**: keyed writes in update mode. Writing the same key twice replaces the
//!   previous value for downstream consumers, which makes re-delivery harmless.
//!
//! # Implementations
//!
//! - `InMemorySourceLog` / `InMemorySinkLog` in `tally-testing` - for tests
//! - `RedpandaSource` / `RedpandaSink` in `tally-redpanda` - Kafka-compatible brokers
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` instead of using `async fn` so they can
//! be shared as `Arc<dyn SourceLog>` between partition workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a partition within the source topic.
pub type PartitionId = i32;

/// Errors raised by log transports.
///
/// All variants are treated as transient: fetches are retried before a batch is
/// abandoned, publishes are retried and then carried over to the next batch.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Failed to connect to the broker or create a client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to read from a source partition
    #[error("Fetch failed for partition {partition}: {reason}")]
    FetchFailed {
        /// The partition being read
        partition: PartitionId,
        /// The reason for failure
        reason: String,
    },

    /// Failed to write a keyed record downstream
    #[error("Publish failed for key '{key}': {reason}")]
    PublishFailed {
        /// The record key
        key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to discover topic metadata
    #[error("Metadata unavailable for topic '{topic}': {reason}")]
    MetadataUnavailable {
        /// The topic queried
        topic: String,
        /// The reason for failure
        reason: String,
    },
}

/// Where to start reading a partition that has no recorded position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartingOffsets {
    /// Start from the oldest retained record
    #[default]
    Earliest,
    /// Start from the end; only records written from now on are read
    Latest,
}

impl fmt::Display for StartingOffsets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

impl FromStr for StartingOffsets {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(format!("unknown starting offsets policy '{other}'")),
        }
    }
}

/// A raw record read from the source log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// Partition the record was read from
    pub partition: PartitionId,
    /// Offset of the record within its partition
    pub offset: i64,
    /// Record key, if any
    pub key: Option<Vec<u8>>,
    /// Raw record value
    pub payload: Vec<u8>,
}

impl SourceRecord {
    /// Create a record without a key.
    #[must_use]
    pub fn new(partition: PartitionId, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            payload: payload.into(),
        }
    }
}

/// Result of one fetch against a single partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBatch {
    /// Records in partition order
    pub records: Vec<SourceRecord>,
    /// Next position to read from, if known
    ///
    /// `None` means the transport could not determine a concrete position (for
    /// example, an empty read positioned by a starting-offsets policy).
    pub next_position: Option<i64>,
}

impl FetchedBatch {
    /// An empty fetch that leaves the position unchanged.
    #[must_use]
    pub const fn empty(next_position: Option<i64>) -> Self {
        Self {
            records: Vec::new(),
            next_position,
        }
    }
}

/// Source of transaction records: a partitioned, append-only, at-least-once log.
///
/// # Examples
///
/// ```rust,ignore
/// let partitions = source.partitions().await?;
/// for partition in partitions {
///     let batch = source.fetch(partition, tracker.position(partition), 1000).await?;
///     println!("{} records, next = {:?}", batch.records.len(), batch.next_position);
/// }
/// ```
pub trait SourceLog: Send + Sync {
    /// List the partitions of the subscribed topic.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MetadataUnavailable`] if the topic cannot be described.
    fn partitions(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartitionId>, TransportError>> + Send + '_>>;

    /// Read up to `max_records` records from `partition` starting at `from`.
    ///
    /// When `from` is `None` the implementation applies its [`StartingOffsets`]
    /// policy. Records are returned in partition order.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::FetchFailed`] if the partition cannot be read.
    fn fetch(
        &self,
        partition: PartitionId,
        from: Option<i64>,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedBatch, TransportError>> + Send + '_>>;
}

/// Downstream log receiving keyed records in update mode.
pub trait SinkLog: Send + Sync {
    /// Write `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the broker does not acknowledge
    /// the write.
    fn write(
        &self,
        key: &str,
        value: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_offsets_parse_case_insensitive() {
        assert_eq!("Earliest".parse::<StartingOffsets>(), Ok(StartingOffsets::Earliest));
        assert_eq!(" latest ".parse::<StartingOffsets>(), Ok(StartingOffsets::Latest));
        assert!("beginning".parse::<StartingOffsets>().is_err());
    }

    #[test]
    fn starting_offsets_display_round_trips() {
        for policy in [StartingOffsets::Earliest, StartingOffsets::Latest] {
            assert_eq!(policy.to_string().parse::<StartingOffsets>(), Ok(policy));
        }
    }

    #[test]
    fn traits_are_dyn_compatible() {
        fn assert_dyn(_: Option<&dyn SourceLog>, _: Option<&dyn SinkLog>) {}
        assert_dyn(None, None);
    }
}
