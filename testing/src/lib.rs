//! # Tally Testing
//!
//! Test doubles and helpers for the Tally aggregation engine.
//!
//! This crate provides:
//! - In-memory source and sink logs with failure injection
//! - An in-memory checkpoint store that encodes like a durable one
//! - A dead-letter recorder
//! - Transaction payload fixtures and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use tally_testing::{InMemoryCheckpointStore, InMemorySinkLog, InMemorySourceLog, transaction};
//!
//! #[tokio::test]
//! async fn aggregates_one_batch() {
//!     let source = InMemorySourceLog::new(1);
//!     source.append(0, transaction("M1", 10.0));
//!     let sink = InMemorySinkLog::new();
//!
//!     let mut aggregator = Aggregator::builder()
//!         .source(source.clone())
//!         .sink(sink.clone())
//!         .checkpoints(InMemoryCheckpointStore::new())
//!         .recover()
//!         .await
//!         .unwrap();
//!
//!     aggregator.run_batch().await.unwrap();
//!     assert_eq!(sink.latest()["M1"]["transactionCount"], 1);
//! }
//! ```

mod checkpoint_mocks;
mod fixtures;
mod log_mocks;

pub use checkpoint_mocks::{InMemoryCheckpointStore, RecordingDeadLetters};
pub use fixtures::{TransactionFixture, transaction};
pub use log_mocks::{InMemorySinkLog, InMemorySourceLog};

/// Install a `fmt` subscriber honouring `RUST_LOG` that writes through the test
/// harness. Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Proptest strategies for transaction streams.
pub mod properties {
    use proptest::prelude::*;

    /// One generated transaction: source partition, merchant, amount in cents.
    pub type GeneratedTransaction = (i32, String, i64);

    /// Up to `max_len` transactions over `partitions` partitions and a handful of
    /// merchants, with signed amounts so refunds are covered.
    pub fn transactions(
        partitions: i32,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<GeneratedTransaction>> {
        proptest::collection::vec(
            (
                0..partitions.max(1),
                (0u8..6).prop_map(|m| format!("merchant_{m}")),
                -50_000i64..500_000,
            ),
            0..max_len,
        )
    }

    /// Amount in cents as the JSON number a producer would send.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cents_to_amount(cents: i64) -> f64 {
        cents as f64 / 100.0
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;
    use tally_core::{CheckpointStore, SinkLog, SourceLog, StartingOffsets, codec};

    #[tokio::test]
    async fn fixture_parses_as_valid_transaction() {
        let source = InMemorySourceLog::new(1);
        source.append(0, transaction("M1", 12.5));

        let batch = source.fetch(0, None, 10).await.unwrap();
        let event = codec::parse(&batch.records[0]).unwrap();

        assert_eq!(event.merchant_id.as_str(), "M1");
        assert_eq!(event.amount.to_string(), "12.5");
    }

    #[tokio::test]
    async fn source_honours_position_limit_and_policy() {
        let source = InMemorySourceLog::new(1);
        for i in 0..5 {
            source.append_json(0, &json!({ "n": i }));
        }

        let batch = source.fetch(0, Some(1), 2).await.unwrap();
        assert_eq!(batch.records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(batch.next_position, Some(3));

        let latest = InMemorySourceLog::new(1).with_starting_offsets(StartingOffsets::Latest);
        latest.append(0, b"old".to_vec());
        let batch = latest.fetch(0, None, 10).await.unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.next_position, Some(1));
    }

    #[tokio::test]
    async fn source_redelivers_on_request() {
        let source = InMemorySourceLog::new(1);
        for _ in 0..4 {
            source.append(0, b"x".to_vec());
        }
        source.redeliver_next_fetch(0, 2);

        let batch = source.fetch(0, Some(3), 10).await.unwrap();
        assert_eq!(batch.records.first().map(|r| r.offset), Some(1));
        assert_eq!(batch.next_position, Some(4));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let source = InMemorySourceLog::new(1);
        source.fail_next_fetches(1);
        assert!(source.fetch(0, None, 1).await.is_err());
        assert!(source.fetch(0, None, 1).await.is_ok());

        let sink = InMemorySinkLog::new();
        sink.fail_key("M1");
        assert!(sink.write("M1", b"{}").await.is_err());
        sink.heal_key("M1");
        sink.write("M1", br#"{"v":1}"#).await.unwrap();
        sink.write("M1", br#"{"v":2}"#).await.unwrap();
        assert_eq!(sink.latest()["M1"], json!({ "v": 2 }));
        assert_eq!(sink.write_count(), 2);
    }

    #[tokio::test]
    async fn corrupted_checkpoint_fails_to_load() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = tally_core::Checkpoint {
            version: 1,
            offsets: tally_core::PartitionOffsets::new(),
            state: tally_core::StateSnapshot::default(),
            pending_publish: Vec::new(),
            created_at: chrono::Utc::now(),
        };
        store.commit(&checkpoint).await.unwrap();
        assert!(store.commit(&checkpoint).await.is_err());
        assert_eq!(store.latest().await.unwrap(), Some(checkpoint));

        store.corrupt_latest();
        assert!(store.latest().await.is_err());
    }
}
