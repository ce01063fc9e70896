//! Per-partition progress through the source log.
//!
//! The [`OffsetTracker`] records, for each source partition, the next position to read.
//! It performs no I/O: the checkpoint coordinator snapshots it with
//! [`OffsetTracker::positions`] and rebuilds it with [`OffsetTracker::restore`].

use crate::log::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of per-partition positions, as stored in a checkpoint.
pub type PartitionOffsets = BTreeMap<PartitionId, i64>;

/// Monotonic per-partition position tracker.
///
/// # Example
///
/// ```
/// use tally_core::OffsetTracker;
///
/// let mut tracker = OffsetTracker::new();
/// assert!(tracker.advance(0, 10));
/// assert!(!tracker.advance(0, 7)); // replayed, ignored
/// assert_eq!(tracker.position(0), Some(10));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetTracker {
    positions: PartitionOffsets,
}

impl OffsetTracker {
    /// Create an empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            positions: BTreeMap::new(),
        }
    }

    /// Record `position` as the next position to read for `partition`.
    ///
    /// Only strictly increasing positions are accepted. Returns `false` (and leaves
    /// the tracker unchanged) for a position at or behind the current one, which
    /// happens when a transport replays records out of order.
    pub fn advance(&mut self, partition: PartitionId, position: i64) -> bool {
        match self.positions.get(&partition) {
            Some(&current) if position <= current => {
                tracing::debug!(
                    partition,
                    current,
                    rejected = position,
                    "Ignoring non-increasing offset"
                );
                false
            }
            _ => {
                self.positions.insert(partition, position);
                true
            }
        }
    }

    /// The next position to read for `partition`, if one has been recorded.
    #[must_use]
    pub fn position(&self, partition: PartitionId) -> Option<i64> {
        self.positions.get(&partition).copied()
    }

    /// A copy of every recorded position.
    #[must_use]
    pub fn positions(&self) -> PartitionOffsets {
        self.positions.clone()
    }

    /// Replace all positions with `snapshot`.
    pub fn restore(&mut self, snapshot: PartitionOffsets) {
        self.positions = snapshot;
    }

    /// Number of partitions with a recorded position.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether no position has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn first_advance_is_accepted_for_any_position() {
        let mut tracker = OffsetTracker::new();
        assert!(tracker.advance(3, 0));
        assert_eq!(tracker.position(3), Some(0));
        assert_eq!(tracker.position(4), None);
    }

    #[test]
    fn equal_position_is_ignored() {
        let mut tracker = OffsetTracker::new();
        assert!(tracker.advance(0, 5));
        assert!(!tracker.advance(0, 5));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.advance(0, 100);
        assert!(tracker.advance(1, 1));
        assert_eq!(tracker.position(0), Some(100));
        assert_eq!(tracker.position(1), Some(1));
    }

    #[test]
    fn restore_replaces_positions() {
        let mut tracker = OffsetTracker::new();
        tracker.advance(0, 100);

        let mut snapshot = PartitionOffsets::new();
        snapshot.insert(1, 42);
        tracker.restore(snapshot);

        assert_eq!(tracker.position(0), None);
        assert_eq!(tracker.position(1), Some(42));
        assert_eq!(tracker.len(), 1);
    }

    proptest! {
        #[test]
        fn position_is_running_maximum(updates in proptest::collection::vec(0i64..1_000, 1..50)) {
            let mut tracker = OffsetTracker::new();
            for &update in &updates {
                tracker.advance(0, update);
            }
            prop_assert_eq!(tracker.position(0), updates.iter().copied().max());
        }
    }
}
