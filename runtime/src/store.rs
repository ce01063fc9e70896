//! Sharded key-value store of per-merchant aggregates.
//!
//! Merchants are hashed onto a fixed number of shards, each behind its own mutex.
//! Updates to merchants on different shards proceed in parallel; updates to the same
//! merchant always serialize on its shard. [`AggregateStore::snapshot`] locks every
//! shard in index order, so it sees a single point in time and cannot deadlock with
//! another snapshot.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tally_core::{AggregateDelta, AggregateState, MerchantId, OffsetMark, StateError, StateSnapshot};

/// Shard count used by [`AggregateStore::new`].
pub const DEFAULT_SHARDS: usize = 16;

type Shard = HashMap<MerchantId, AggregateState>;

/// In-memory aggregate store with per-shard locking.
///
/// Shared between partition workers as `Arc<AggregateStore>`.
#[derive(Debug)]
pub struct AggregateStore {
    shards: Vec<Mutex<Shard>>,
}

impl Default for AggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateStore {
    /// An empty store with [`DEFAULT_SHARDS`] shards.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// An empty store with `shards` shards (at least one).
    #[must_use]
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(Shard::new())).collect(),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard_index(&self, merchant: &MerchantId) -> usize {
        let mut hasher = DefaultHasher::new();
        merchant.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    // A panic while holding a shard lock cannot leave an aggregate half-updated:
    // `AggregateState::apply` only writes after both checked additions succeed.
    fn lock(&self, index: usize) -> MutexGuard<'_, Shard> {
        self.shards[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current aggregate for `merchant`, if any event has been applied to it.
    #[must_use]
    pub fn get(&self, merchant: &MerchantId) -> Option<AggregateState> {
        self.lock(self.shard_index(merchant)).get(merchant).cloned()
    }

    /// Atomically add `delta` to `merchant`'s aggregate, creating it on first use.
    ///
    /// Returns the aggregate after the update.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on numeric overflow; the stored aggregate (or its
    /// absence) is left exactly as it was.
    pub fn apply(
        &self,
        merchant: &MerchantId,
        delta: AggregateDelta,
        mark: OffsetMark,
    ) -> Result<AggregateState, StateError> {
        let mut shard = self.lock(self.shard_index(merchant));

        if let Some(state) = shard.get_mut(merchant) {
            state.apply(delta, mark)?;
            return Ok(state.clone());
        }

        let mut state = AggregateState::new(merchant.clone());
        state.apply(delta, mark)?;
        shard.insert(merchant.clone(), state.clone());
        Ok(state)
    }

    /// Consistent copy of every aggregate, sorted by merchant.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let guards: Vec<_> = (0..self.shards.len()).map(|i| self.lock(i)).collect();
        let aggregates = guards
            .iter()
            .flat_map(|shard| shard.values().cloned())
            .collect();
        StateSnapshot::new(aggregates)
    }

    /// Replace the whole store with `snapshot`.
    pub fn restore(&self, snapshot: StateSnapshot) {
        let mut guards: Vec<_> = (0..self.shards.len()).map(|i| self.lock(i)).collect();
        for shard in &mut guards {
            shard.clear();
        }
        for state in snapshot.aggregates {
            let index = self.shard_index(&state.merchant_id);
            guards[index].insert(state.merchant_id.clone(), state);
        }
    }

    /// Number of merchants held.
    #[must_use]
    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.lock(i).len()).sum()
    }

    /// Whether no merchant has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All known merchants, sorted.
    #[must_use]
    pub fn merchants(&self) -> Vec<MerchantId> {
        let mut merchants: Vec<_> = (0..self.shards.len())
            .flat_map(|i| self.lock(i).keys().cloned().collect::<Vec<_>>())
            .collect();
        merchants.sort();
        merchants
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tally_core::Decimal;

    fn delta(amount: i64) -> AggregateDelta {
        AggregateDelta {
            amount: Decimal::from(amount),
            count: 1,
        }
    }

    #[test]
    fn apply_creates_then_updates() {
        let store = AggregateStore::new();
        let m1 = MerchantId::new("M1");

        assert!(store.get(&m1).is_none());
        store.apply(&m1, delta(10), OffsetMark::new(1)).unwrap();
        let state = store.apply(&m1, delta(5), OffsetMark::new(2)).unwrap();

        assert_eq!(state.total_amount, Decimal::from(15));
        assert_eq!(state.transaction_count, 2);
        assert_eq!(state.last_offset_mark, OffsetMark::new(2));
        assert_eq!(store.get(&m1), Some(state));
    }

    #[test]
    fn overflow_keeps_previous_value() {
        let store = AggregateStore::new();
        let m1 = MerchantId::new("M1");
        let huge = AggregateDelta {
            amount: Decimal::MAX,
            count: 1,
        };

        store.apply(&m1, huge, OffsetMark::new(1)).unwrap();
        assert!(store.apply(&m1, huge, OffsetMark::new(2)).is_err());

        let state = store.get(&m1).unwrap();
        assert_eq!(state.total_amount, Decimal::MAX);
        assert_eq!(state.transaction_count, 1);
    }

    #[test]
    fn same_key_updates_serialize_across_threads() {
        let store = Arc::new(AggregateStore::with_shards(4));
        let m1 = MerchantId::new("hot");

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = Arc::clone(&store);
                let m1 = m1.clone();
                scope.spawn(move || {
                    for _ in 0..1_000 {
                        store.apply(&m1, delta(1), OffsetMark::new(1)).unwrap();
                    }
                });
            }
        });

        let state = store.get(&m1).unwrap();
        assert_eq!(state.transaction_count, 8_000);
        assert_eq!(state.total_amount, Decimal::from(8_000));
    }

    #[test]
    fn snapshot_is_sorted_and_restorable() {
        let store = AggregateStore::new();
        for id in ["m3", "m1", "m2"] {
            store.apply(&MerchantId::new(id), delta(1), OffsetMark::new(1)).unwrap();
        }

        let snapshot = store.snapshot();
        let ids: Vec<_> = snapshot.aggregates.iter().map(|a| a.merchant_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        let other = AggregateStore::with_shards(3);
        other.apply(&MerchantId::new("stale"), delta(9), OffsetMark::new(1)).unwrap();
        other.restore(snapshot.clone());

        assert_eq!(other.snapshot(), snapshot);
        assert!(other.get(&MerchantId::new("stale")).is_none());
        assert_eq!(other.merchants().len(), 3);
    }

    proptest! {
        #[test]
        fn snapshot_restore_preserves_every_aggregate(
            updates in proptest::collection::vec((0u8..20, -1_000i64..1_000), 0..200)
        ) {
            let store = AggregateStore::new();
            for (merchant, amount) in &updates {
                let id = MerchantId::new(format!("m{merchant}"));
                store.apply(&id, delta(*amount), OffsetMark::new(1)).unwrap();
            }

            let restored = AggregateStore::with_shards(5);
            restored.restore(store.snapshot());

            prop_assert_eq!(restored.len(), store.len());
            for id in store.merchants() {
                prop_assert_eq!(restored.get(&id), store.get(&id));
            }
        }
    }
}
