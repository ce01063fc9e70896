//! Checkpoint coordination: atomic commit of offsets and state, and recovery.
//!
//! # Phases
//!
//! ```text
//! Recovering --recover()--> Running --commit()--> Committing --ok--> Running
//!                                                      |
//!                                                      +--retries exhausted--> (halted)
//! ```
//!
//! A coordinator whose commit failed stays in [`Phase::Committing`] and refuses every
//! further commit: the in-memory state has moved past the last durable checkpoint and
//! only a restart, which recovers from that checkpoint, can reconcile them.

use crate::metrics::CheckpointMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::store::AggregateStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tally_core::{
    Checkpoint, CheckpointError, CheckpointStore, MerchantId, OffsetMark, OffsetTracker,
};
use thiserror::Error;

/// Coordinator lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Loading the latest checkpoint; no batch may run
    Recovering,
    /// Processing batches
    Running,
    /// Persisting a checkpoint, or halted after a failed commit
    Committing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recovering => f.write_str("recovering"),
            Self::Running => f.write_str("running"),
            Self::Committing => f.write_str("committing"),
        }
    }
}

/// Errors from checkpoint coordination.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Checkpoint storage failed
    #[error(transparent)]
    Storage(#[from] CheckpointError),

    /// The operation is not valid in the current phase
    #[error("Cannot {operation} while {phase}")]
    InvalidPhase {
        /// What was attempted
        operation: &'static str,
        /// Phase at the time
        phase: Phase,
    },
}

/// Result of recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    /// Version of the checkpoint restored, `0` on first start
    pub version: u64,
    /// Merchants whose aggregates must be (re)published
    pub pending_publish: Vec<MerchantId>,
}

/// Owns the checkpoint protocol for one pipeline.
pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    policy: RetryPolicy,
    phase: Phase,
    version: u64,
}

impl CheckpointCoordinator {
    /// A coordinator in [`Phase::Recovering`].
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            phase: Phase::Recovering,
            version: 0,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Version of the last durable checkpoint, `0` if none.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether a failed commit has halted this coordinator.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.phase == Phase::Committing
    }

    /// Mark stamped on aggregates changed by the batch that will be committed next.
    #[must_use]
    pub const fn next_mark(&self) -> OffsetMark {
        OffsetMark::new(self.version + 1)
    }

    /// Restore `tracker` and `state` from the latest checkpoint.
    ///
    /// With no checkpoint both are left empty and reading starts from the source's
    /// starting-offsets policy.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Storage`] if the latest checkpoint cannot be read or
    /// decoded, leaving the coordinator in [`Phase::Recovering`].
    pub async fn recover(
        &mut self,
        tracker: &mut OffsetTracker,
        state: &AggregateStore,
    ) -> Result<Recovered, CoordinatorError> {
        if self.phase != Phase::Recovering {
            return Err(CoordinatorError::InvalidPhase {
                operation: "recover",
                phase: self.phase,
            });
        }

        let recovered = match self.store.latest().await? {
            Some(checkpoint) => {
                tracing::info!(
                    version = checkpoint.version,
                    partitions = checkpoint.offsets.len(),
                    merchants = checkpoint.state.len(),
                    pending = checkpoint.pending_publish.len(),
                    created_at = %checkpoint.created_at,
                    "Recovered from checkpoint"
                );
                tracker.restore(checkpoint.offsets);
                state.restore(checkpoint.state);
                Recovered {
                    version: checkpoint.version,
                    pending_publish: checkpoint.pending_publish,
                }
            }
            None => {
                tracing::info!("No checkpoint found, starting fresh");
                tracker.restore(tally_core::PartitionOffsets::new());
                state.restore(tally_core::StateSnapshot::default());
                Recovered {
                    version: 0,
                    pending_publish: Vec::new(),
                }
            }
        };

        self.version = recovered.version;
        self.phase = Phase::Running;
        Ok(recovered)
    }

    /// Durably commit the current offsets and state as version `version() + 1`.
    ///
    /// `pending_publish` is stored with the checkpoint so a crash before publishing
    /// completes is healed on recovery. Returns the committed version.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidPhase`] unless running, and
    /// [`CoordinatorError::Storage`] once retries are exhausted; the coordinator is
    /// then halted.
    pub async fn commit(
        &mut self,
        tracker: &OffsetTracker,
        state: &AggregateStore,
        pending_publish: Vec<MerchantId>,
    ) -> Result<u64, CoordinatorError> {
        if self.phase != Phase::Running {
            return Err(CoordinatorError::InvalidPhase {
                operation: "commit",
                phase: self.phase,
            });
        }
        self.phase = Phase::Committing;

        let checkpoint = Checkpoint {
            version: self.version + 1,
            offsets: tracker.positions(),
            state: state.snapshot(),
            pending_publish,
            created_at: Utc::now(),
        };

        let started = Instant::now();
        let store = Arc::clone(&self.store);
        let result = retry_with_predicate(
            &self.policy,
            "checkpoint_commit",
            || store.commit(&checkpoint),
            |e| matches!(e, CheckpointError::Write { .. }),
        )
        .await;

        match result {
            Ok(()) => {
                CheckpointMetrics::record_commit(started.elapsed());
                self.version = checkpoint.version;
                self.phase = Phase::Running;
                tracing::info!(
                    version = checkpoint.version,
                    partitions = checkpoint.offsets.len(),
                    merchants = checkpoint.state.len(),
                    "Checkpoint committed"
                );
                Ok(checkpoint.version)
            }
            Err(e) => {
                CheckpointMetrics::record_failure();
                tracing::error!(
                    version = checkpoint.version,
                    error = %e,
                    "Checkpoint commit failed, halting"
                );
                Err(e.into())
            }
        }
    }
}
