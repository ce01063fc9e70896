//! Redpanda transports for Tally.
//!
//! This crate implements the [`SourceLog`] and [`SinkLog`] traits from `tally-core`
//! on top of rdkafka, so any Kafka-compatible broker works (Redpanda, Apache Kafka,
//! MSK, ...).
//!
//! # Offsets
//!
//! [`RedpandaSource`] never uses broker-side consumer group offsets. Each partition
//! is read by its own consumer, manually assigned at the position the aggregator
//! asks for; the aggregator persists positions in its own checkpoints. The
//! `group.id` is only set because librdkafka requires one.
//!
//! # Delivery Semantics
//!
//! - **Source**: at-least-once. Re-reading a range yields the same records.
//! - **Sink**: keyed writes with `acks=all` and the idempotent producer enabled.
//!   Downstream consumers should treat the topic as a changelog (latest value per
//!   key wins), ideally with log compaction enabled.
//!
//! # Example
//!
//! ```no_run
//! use tally_redpanda::{RedpandaSink, RedpandaSource};
//! use tally_core::StartingOffsets;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = RedpandaSource::builder()
//!     .brokers("localhost:9092")
//!     .topic("transactions")
//!     .starting_offsets(StartingOffsets::Earliest)
//!     .build()?;
//!
//! let sink = RedpandaSink::builder()
//!     .brokers("localhost:9092")
//!     .topic("merchant-aggregates")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod sink;
mod source;

pub use sink::{RedpandaSink, RedpandaSinkBuilder};
pub use source::{RedpandaSource, RedpandaSourceBuilder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<RedpandaSource>();
        assert_send_sync::<RedpandaSink>();
    }
}
