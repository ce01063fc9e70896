//! # Tally Core
//!
//! Core types and collaborator traits for Tally, a micro-batch engine that keeps a
//! running per-merchant aggregate (total amount, transaction count) over a partitioned
//! stream of transaction events and republishes every change downstream.
//!
//! This crate has no I/O of its own. It defines:
//!
//! - **Events**: [`TransactionEvent`] and the [`codec`] that parses raw record bytes
//!   into it and serializes outgoing aggregates
//! - **State**: [`AggregateState`] and the [`AggregateDelta`] applied per event
//! - **Progress**: the [`OffsetTracker`] recording the next position per partition
//! - **Durability**: [`Checkpoint`] and the [`CheckpointStore`] trait
//! - **Transports**: the [`SourceLog`] / [`SinkLog`] traits for the input and output logs
//! - **Anomalies**: the [`DeadLetterSink`] trait receiving rejected records
//!
//! ## Exactly-once-effective output
//!
//! ```text
//!  SourceLog ──fetch──► codec ──► engine ──► state store
//!                                               │
//!                     offsets + state snapshot  ▼
//!                     ───────────────────► CheckpointStore (atomic)
//!                                               │ durable
//!                                               ▼
//!                                           SinkLog (keyed, update mode)
//! ```
//!
//! Offsets and state are committed together before anything is published. A crash
//! before the commit replays the batch from the previous checkpoint; a crash after it
//! republishes the full aggregate under the same key, which downstream treats as an
//! overwrite rather than a second count.

pub mod aggregate;
pub mod checkpoint;
pub mod codec;
pub mod dead_letter;
pub mod event;
pub mod log;
pub mod offset;

// Re-export commonly used types
pub use aggregate::{AggregateDelta, AggregateState, OffsetMark, StateError};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, StateSnapshot};
pub use chrono::{DateTime, Utc};
pub use codec::{ParseError, ParseFailure};
pub use dead_letter::{Anomaly, AnomalyKind, DeadLetterSink, DiscardDeadLetters};
pub use event::{MerchantId, SourcePosition, TransactionEvent};
pub use log::{
    FetchedBatch, PartitionId, SinkLog, SourceLog, SourceRecord, StartingOffsets,
    TransportError,
};
pub use offset::{OffsetTracker, PartitionOffsets};
pub use rust_decimal::Decimal;
