//! Checkpoints: the durable unit tying source offsets to a state snapshot.
//!
//! A [`Checkpoint`] is immutable once committed and is superseded, never mutated, by
//! the next one. Recovery reads only the latest checkpoint; nothing else is consulted.
//!
//! # Binary format
//!
//! ```text
//! TALLYCP1 | bincode(Checkpoint)
//! ```
//!
//! The 8-byte magic lets a store tell a truncated or foreign file apart from a
//! checkpoint written by an incompatible build.

use crate::aggregate::AggregateState;
use crate::event::MerchantId;
use crate::offset::PartitionOffsets;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

const MAGIC: &[u8; 8] = b"TALLYCP1";

/// Errors from checkpoint storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// Persisting a checkpoint failed
    #[error("Failed to write checkpoint v{version}: {reason}")]
    Write {
        /// Version being written
        version: u64,
        /// The reason for failure
        reason: String,
    },

    /// Reading checkpoint storage failed
    #[error("Failed to read checkpoint at {location}: {reason}")]
    Read {
        /// Storage location
        location: String,
        /// The reason for failure
        reason: String,
    },

    /// The latest checkpoint exists but cannot be decoded
    #[error("Checkpoint at {location} is corrupt: {reason}")]
    Corrupt {
        /// Storage location of the bad checkpoint
        location: String,
        /// The reason for failure
        reason: String,
    },

    /// A checkpoint with this version is already committed
    #[error("Checkpoint v{version} already exists")]
    AlreadyExists {
        /// The conflicting version
        version: u64,
    },
}

/// Point-in-time copy of every aggregate, sorted by merchant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Aggregates in merchant order
    pub aggregates: Vec<AggregateState>,
}

impl StateSnapshot {
    /// Build a snapshot, sorting by merchant so equal states encode identically.
    #[must_use]
    pub fn new(mut aggregates: Vec<AggregateState>) -> Self {
        aggregates.sort_by(|a, b| a.merchant_id.cmp(&b.merchant_id));
        Self { aggregates }
    }

    /// Number of merchants in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    /// Whether the snapshot holds no aggregates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }
}

/// One committed batch: offsets and state, persisted together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic version, one greater than the previous checkpoint
    pub version: u64,
    /// Next position to read for every partition
    pub offsets: PartitionOffsets,
    /// Aggregates as of this batch
    pub state: StateSnapshot,
    /// Merchants whose latest aggregate has not been confirmed downstream
    pub pending_publish: Vec<MerchantId>,
    /// When the checkpoint was built
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Encode with the magic prefix.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Write`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        let body = bincode::serialize(self).map_err(|e| CheckpointError::Write {
            version: self.version,
            reason: e.to_string(),
        })?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Decode bytes read from `location`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupt`] naming `location` if the magic is missing
    /// or the payload does not decode.
    pub fn from_bytes(bytes: &[u8], location: &str) -> Result<Self, CheckpointError> {
        let corrupt = |reason: String| CheckpointError::Corrupt {
            location: location.to_string(),
            reason,
        };

        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| corrupt("missing checkpoint header".to_string()))?;
        bincode::deserialize(body).map_err(|e| corrupt(e.to_string()))
    }
}

/// Durable storage for checkpoints.
///
/// `commit` must be atomic: after it returns `Ok`, [`CheckpointStore::latest`] returns
/// the new checkpoint even across a crash; if it fails or the process dies midway,
/// `latest` still returns the previous one. Implementations never overwrite a
/// committed version.
///
/// # Implementations
///
/// - `InMemoryCheckpointStore` in `tally-testing`
/// - `FileCheckpointStore` in `tally-runtime`
/// - `PostgresCheckpointStore` in `tally-postgres`
pub trait CheckpointStore: Send + Sync {
    /// Load the most recent committed checkpoint, or `None` on first start.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupt`] if the newest checkpoint cannot be decoded
    /// and [`CheckpointError::Read`] if storage is unreachable.
    fn latest(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>;

    /// Atomically persist `checkpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::AlreadyExists`] if the version is taken and
    /// [`CheckpointError::Write`] on any storage failure.
    fn commit<'a>(
        &'a self,
        checkpoint: &'a Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>>;
}
