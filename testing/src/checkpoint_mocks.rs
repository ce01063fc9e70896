//! In-memory checkpoint storage and dead-letter recording.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned test locks

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tally_core::{Anomaly, Checkpoint, CheckpointError, CheckpointStore, DeadLetterSink};

#[derive(Debug, Default)]
struct StoreState {
    // Encoded exactly as a durable store would hold them, so decoding is exercised.
    checkpoints: BTreeMap<u64, Vec<u8>>,
    failing_commits: usize,
    commit_attempts: usize,
}

/// In-memory [`CheckpointStore`].
///
/// Clones share storage: dropping an aggregator and building a new one over a clone
/// is how tests simulate a crash and restart.
///
/// # Example
///
/// ```
/// use tally_testing::InMemoryCheckpointStore;
/// use tally_core::CheckpointStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCheckpointStore::new();
/// assert!(store.latest().await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryCheckpointStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commit attempts with [`CheckpointError::Write`].
    pub fn fail_next_commits(&self, count: usize) {
        self.state.write().unwrap().failing_commits = count;
    }

    /// Committed versions, oldest first.
    #[must_use]
    pub fn versions(&self) -> Vec<u64> {
        self.state.read().unwrap().checkpoints.keys().copied().collect()
    }

    /// Newest committed version.
    #[must_use]
    pub fn latest_version(&self) -> Option<u64> {
        self.state.read().unwrap().checkpoints.keys().next_back().copied()
    }

    /// Decode a committed checkpoint.
    #[must_use]
    pub fn get(&self, version: u64) -> Option<Checkpoint> {
        self.state
            .read()
            .unwrap()
            .checkpoints
            .get(&version)
            .map(|bytes| Checkpoint::from_bytes(bytes, &format!("memory://v{version}")).unwrap())
    }

    /// Commit attempts seen, failed ones included.
    #[must_use]
    pub fn commit_attempts(&self) -> usize {
        self.state.read().unwrap().commit_attempts
    }

    /// Overwrite the newest checkpoint with garbage.
    pub fn corrupt_latest(&self) {
        let mut state = self.state.write().unwrap();
        if let Some(bytes) = state.checkpoints.values_mut().next_back() {
            bytes.truncate(bytes.len() / 2);
        }
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn latest(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>
    {
        let result = self
            .state
            .read()
            .unwrap()
            .checkpoints
            .iter()
            .next_back()
            .map(|(version, bytes)| Checkpoint::from_bytes(bytes, &format!("memory://v{version}")))
            .transpose();
        Box::pin(async move { result })
    }

    fn commit<'a>(
        &'a self,
        checkpoint: &'a Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = checkpoint.to_bytes()?;
            let mut state = self.state.write().unwrap();
            state.commit_attempts += 1;

            if state.failing_commits > 0 {
                state.failing_commits -= 1;
                return Err(CheckpointError::Write {
                    version: checkpoint.version,
                    reason: "injected commit failure".to_string(),
                });
            }
            if state.checkpoints.contains_key(&checkpoint.version) {
                return Err(CheckpointError::AlreadyExists {
                    version: checkpoint.version,
                });
            }
            state.checkpoints.insert(checkpoint.version, bytes);
            Ok(())
        })
    }
}

/// [`DeadLetterSink`] that keeps every routed anomaly.
#[derive(Clone, Debug, Default)]
pub struct RecordingDeadLetters {
    anomalies: Arc<RwLock<Vec<Anomaly>>>,
}

impl RecordingDeadLetters {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Anomalies routed so far, in routing order.
    #[must_use]
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.read().unwrap().clone()
    }

    /// Number of anomalies routed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.anomalies.read().unwrap().len()
    }

    /// Whether nothing has been routed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anomalies.read().unwrap().is_empty()
    }
}

impl DeadLetterSink for RecordingDeadLetters {
    fn route<'a>(&'a self, anomaly: &'a Anomaly) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.anomalies.write().unwrap().push(anomaly.clone());
        Box::pin(async {})
    }
}
