//! In-memory source and sink logs with failure injection.
//!
//! - [`InMemorySourceLog`]: partitioned append-only log implementing `SourceLog`
//! - [`InMemorySinkLog`]: keyed downstream log implementing `SinkLog`
//!
//! Both are cheap to clone and clones share state, so a test can keep a handle while
//! the aggregator owns another.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned test locks

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tally_core::{
    FetchedBatch, PartitionId, SinkLog, SourceLog, SourceRecord, StartingOffsets, TransportError,
};

#[derive(Debug, Default)]
struct SourceState {
    partitions: BTreeMap<PartitionId, Vec<SourceRecord>>,
    starting: StartingOffsets,
    failing_fetches: usize,
    failing_partitions: HashSet<PartitionId>,
    rewind: BTreeMap<PartitionId, i64>,
    fetch_calls: usize,
}

/// Partitioned in-memory source log.
///
/// Offsets start at zero and are dense. Fetching with no position applies the
/// configured [`StartingOffsets`].
///
/// # Example
///
/// ```
/// use tally_testing::InMemorySourceLog;
/// use tally_core::SourceLog;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = InMemorySourceLog::new(2);
/// source.append(1, br#"{"not":"a transaction"}"#.to_vec());
///
/// let batch = source.fetch(1, None, 100).await?;
/// assert_eq!(batch.records.len(), 1);
/// assert_eq!(batch.next_position, Some(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemorySourceLog {
    state: Arc<RwLock<SourceState>>,
}

impl InMemorySourceLog {
    /// A log with `partitions` empty partitions numbered from zero.
    #[must_use]
    pub fn new(partitions: i32) -> Self {
        let state = SourceState {
            partitions: (0..partitions.max(0)).map(|p| (p, Vec::new())).collect(),
            ..SourceState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Use `policy` for partitions fetched without a position.
    #[must_use]
    pub fn with_starting_offsets(self, policy: StartingOffsets) -> Self {
        self.state.write().unwrap().starting = policy;
        self
    }

    /// Append a raw payload to `partition`, returning its offset.
    ///
    /// Unknown partitions are created on demand.
    pub fn append(&self, partition: PartitionId, payload: impl Into<Vec<u8>>) -> i64 {
        let mut state = self.state.write().unwrap();
        let log = state.partitions.entry(partition).or_default();
        let offset = i64::try_from(log.len()).unwrap();
        log.push(SourceRecord::new(partition, offset, payload));
        offset
    }

    /// Append a JSON value to `partition`, returning its offset.
    pub fn append_json(&self, partition: PartitionId, value: &Value) -> i64 {
        self.append(partition, serde_json::to_vec(value).unwrap())
    }

    /// Fail the next `count` fetches, whatever the partition.
    pub fn fail_next_fetches(&self, count: usize) {
        self.state.write().unwrap().failing_fetches = count;
    }

    /// Fail every fetch of `partition` until [`InMemorySourceLog::heal_partition`].
    pub fn fail_partition(&self, partition: PartitionId) {
        self.state.write().unwrap().failing_partitions.insert(partition);
    }

    /// Stop failing fetches of `partition`.
    pub fn heal_partition(&self, partition: PartitionId) {
        self.state.write().unwrap().failing_partitions.remove(&partition);
    }

    /// Make the next fetch of `partition` start `count` records before the requested
    /// position, as a broker redelivering already-read records would.
    pub fn redeliver_next_fetch(&self, partition: PartitionId, count: i64) {
        self.state.write().unwrap().rewind.insert(partition, count);
    }

    /// Number of records in `partition`.
    #[must_use]
    pub fn len(&self, partition: PartitionId) -> usize {
        self.state
            .read()
            .unwrap()
            .partitions
            .get(&partition)
            .map_or(0, Vec::len)
    }

    /// Whether every partition is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().partitions.values().all(Vec::is_empty)
    }

    /// Total fetch calls served, failed ones included.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.state.read().unwrap().fetch_calls
    }

    fn read(
        &self,
        partition: PartitionId,
        from: Option<i64>,
        max_records: usize,
    ) -> Result<FetchedBatch, TransportError> {
        let mut state = self.state.write().unwrap();
        state.fetch_calls += 1;

        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(TransportError::FetchFailed {
                partition,
                reason: "injected fetch failure".to_string(),
            });
        }
        if state.failing_partitions.contains(&partition) {
            return Err(TransportError::FetchFailed {
                partition,
                reason: "partition unavailable".to_string(),
            });
        }

        let rewind = state.rewind.remove(&partition).unwrap_or(0);
        let starting = state.starting;
        let Some(log) = state.partitions.get(&partition) else {
            return Err(TransportError::FetchFailed {
                partition,
                reason: "unknown partition".to_string(),
            });
        };

        let end = i64::try_from(log.len()).unwrap();
        let requested = from.unwrap_or(match starting {
            StartingOffsets::Earliest => 0,
            StartingOffsets::Latest => end,
        });
        let start = (requested - rewind).clamp(0, end);
        let stop = (start + i64::try_from(max_records).unwrap()).min(end);

        let records: Vec<SourceRecord> = log
            [usize::try_from(start).unwrap()..usize::try_from(stop).unwrap()]
            .to_vec();
        let next_position = Some(stop.max(requested));

        Ok(FetchedBatch {
            records,
            next_position,
        })
    }
}

impl SourceLog for InMemorySourceLog {
    fn partitions(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartitionId>, TransportError>> + Send + '_>> {
        let partitions: Vec<PartitionId> =
            self.state.read().unwrap().partitions.keys().copied().collect();
        Box::pin(async move { Ok(partitions) })
    }

    fn fetch(
        &self,
        partition: PartitionId,
        from: Option<i64>,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedBatch, TransportError>> + Send + '_>> {
        let result = self.read(partition, from, max_records);
        Box::pin(async move { result })
    }
}

#[derive(Debug, Default)]
struct SinkState {
    writes: Vec<(String, Vec<u8>)>,
    failing_writes: usize,
    failing_keys: HashSet<String>,
}

/// In-memory keyed downstream log.
///
/// Records every write in order; [`InMemorySinkLog::latest`] gives the update-mode
/// view a downstream consumer would see.
#[derive(Clone, Debug, Default)]
pub struct InMemorySinkLog {
    state: Arc<RwLock<SinkState>>,
}

impl InMemorySinkLog {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful write, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.state.read().unwrap().writes.clone()
    }

    /// Keys written, in order, duplicates included.
    #[must_use]
    pub fn written_keys(&self) -> Vec<String> {
        self.state.read().unwrap().writes.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.read().unwrap().writes.len()
    }

    /// Latest value per key, decoded as JSON.
    #[must_use]
    pub fn latest(&self) -> BTreeMap<String, Value> {
        self.state
            .read()
            .unwrap()
            .writes
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::from_slice(value).unwrap()))
            .collect()
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.write().unwrap().failing_writes = count;
    }

    /// Fail every write of `key` until [`InMemorySinkLog::heal_key`].
    pub fn fail_key(&self, key: &str) {
        self.state.write().unwrap().failing_keys.insert(key.to_string());
    }

    /// Stop failing writes of `key`.
    pub fn heal_key(&self, key: &str) {
        self.state.write().unwrap().failing_keys.remove(key);
    }

    /// Forget all recorded writes.
    pub fn clear(&self) {
        self.state.write().unwrap().writes.clear();
    }

    fn record(&self, key: &str, value: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.write().unwrap();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(TransportError::PublishFailed {
                key: key.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }
        if state.failing_keys.contains(key) {
            return Err(TransportError::PublishFailed {
                key: key.to_string(),
                reason: "key rejected".to_string(),
            });
        }
        state.writes.push((key.to_string(), value.to_vec()));
        Ok(())
    }
}

impl SinkLog for InMemorySinkLog {
    fn write(
        &self,
        key: &str,
        value: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let result = self.record(key, value);
        Box::pin(async move { result })
    }
}
