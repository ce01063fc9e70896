//! Downstream publishing of committed aggregates.
//!
//! The publisher only ever sees merchants whose aggregate is already covered by a
//! durable checkpoint. Writes are keyed by merchant in update mode, so re-publishing
//! the same aggregate is an idempotent overwrite and a failed merchant can simply be
//! carried over to the next batch.

use crate::metrics::PublishMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::AggregateStore;
use futures::StreamExt;
use futures::stream;
use std::collections::BTreeSet;
use std::sync::Arc;
use tally_core::{AggregateState, MerchantId, SinkLog, TransportError, codec};

/// Concurrent writes in flight during a flush.
pub const PUBLISH_CONCURRENCY: usize = 16;

/// Result of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Merchants confirmed downstream
    pub published: Vec<MerchantId>,
    /// Merchants left pending
    pub failed: Vec<MerchantId>,
}

/// Writes changed aggregates to a [`SinkLog`] and tracks the ones not yet confirmed.
pub struct SinkPublisher {
    sink: Arc<dyn SinkLog>,
    policy: RetryPolicy,
    concurrency: usize,
    pending: BTreeSet<MerchantId>,
}

impl SinkPublisher {
    /// A publisher with nothing pending.
    #[must_use]
    pub fn new(sink: Arc<dyn SinkLog>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            concurrency: PUBLISH_CONCURRENCY,
            pending: BTreeSet::new(),
        }
    }

    /// Set the number of concurrent writes (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Merchants awaiting downstream confirmation, sorted.
    #[must_use]
    pub fn pending(&self) -> Vec<MerchantId> {
        self.pending.iter().cloned().collect()
    }

    /// Mark merchants as needing publication.
    pub fn enqueue(&mut self, merchants: impl IntoIterator<Item = MerchantId>) {
        self.pending.extend(merchants);
        PublishMetrics::record_pending(self.pending.len());
    }

    /// Write one aggregate, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the aggregate cannot be encoded or
    /// the sink rejects it after retries.
    pub async fn publish(&self, state: &AggregateState) -> Result<(), TransportError> {
        let key = state.merchant_id.as_str();
        let value = codec::encode_aggregate(state).map_err(|e| TransportError::PublishFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        retry_with_backoff(&self.policy, "publish", || self.sink.write(key, &value)).await?;

        tracing::debug!(
            merchant = key,
            total_amount = %state.total_amount,
            transaction_count = state.transaction_count,
            "Published aggregate"
        );
        Ok(())
    }

    /// Enqueue `changed`, then publish everything pending.
    pub async fn publish_changes(
        &mut self,
        changed: &BTreeSet<MerchantId>,
        store: &AggregateStore,
    ) -> PublishReport {
        self.enqueue(changed.iter().cloned());
        self.flush(store).await
    }

    /// Publish the current aggregate of every pending merchant.
    ///
    /// Merchants that fail stay pending; the report lists both outcomes.
    pub async fn flush(&mut self, store: &AggregateStore) -> PublishReport {
        let mut states = Vec::with_capacity(self.pending.len());
        for merchant in std::mem::take(&mut self.pending) {
            match store.get(&merchant) {
                Some(state) => states.push(state),
                None => tracing::warn!(merchant = %merchant, "Dropping pending merchant with no aggregate"),
            }
        }

        let this = &*self;
        let results: Vec<(MerchantId, Result<(), TransportError>)> = stream::iter(states)
            .map(|state| async move {
                let result = this.publish(&state).await;
                (state.merchant_id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = PublishReport::default();
        for (merchant, result) in results {
            match result {
                Ok(()) => {
                    PublishMetrics::record_published();
                    report.published.push(merchant);
                }
                Err(e) => {
                    PublishMetrics::record_failure();
                    tracing::warn!(merchant = %merchant, error = %e, "Publish failed, will retry next batch");
                    report.failed.push(merchant);
                }
            }
        }
        report.published.sort();
        report.failed.sort();

        self.pending.extend(report.failed.iter().cloned());
        PublishMetrics::record_pending(self.pending.len());
        report
    }

    /// Publish every aggregate in `store`, e.g. to rebuild a downstream topic.
    pub async fn republish_all(&mut self, store: &AggregateStore) -> PublishReport {
        self.enqueue(store.merchants());
        self.flush(store).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tally_core::{AggregateDelta, Decimal, OffsetMark};
    use tally_testing::InMemorySinkLog;

    fn store_with(merchants: &[(&str, i64)]) -> AggregateStore {
        let store = AggregateStore::new();
        for (id, amount) in merchants {
            let delta = AggregateDelta {
                amount: Decimal::from(*amount),
                count: 1,
            };
            store.apply(&MerchantId::new(*id), delta, OffsetMark::new(1)).unwrap();
        }
        store
    }

    fn publisher(sink: &InMemorySinkLog) -> SinkPublisher {
        let policy = RetryPolicy::builder()
            .max_retries(1)
            .initial_delay(Duration::from_millis(1))
            .build();
        SinkPublisher::new(Arc::new(sink.clone()), policy)
    }

    fn ids(names: &[&str]) -> BTreeSet<MerchantId> {
        names.iter().map(|n| MerchantId::new(*n)).collect()
    }

    #[tokio::test]
    async fn publishes_changed_aggregates_keyed_by_merchant() {
        let sink = InMemorySinkLog::new();
        let store = store_with(&[("M1", 10), ("M2", 100), ("M3", 1)]);
        let mut publisher = publisher(&sink);

        let report = publisher.publish_changes(&ids(&["M1", "M2"]), &store).await;

        assert_eq!(report.published, vec![MerchantId::new("M1"), MerchantId::new("M2")]);
        assert!(publisher.pending().is_empty());
        let latest = sink.latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(
            latest["M2"],
            json!({"merchantId": "M2", "totalAmount": 100.0, "transactionCount": 1})
        );
    }

    #[tokio::test]
    async fn failed_merchants_stay_pending_until_published() {
        let sink = InMemorySinkLog::new();
        let store = store_with(&[("M1", 10), ("M2", 20)]);
        let mut publisher = publisher(&sink);
        sink.fail_key("M2");

        let report = publisher.publish_changes(&ids(&["M1", "M2"]), &store).await;
        assert_eq!(report.failed, vec![MerchantId::new("M2")]);
        assert_eq!(publisher.pending(), vec![MerchantId::new("M2")]);

        sink.heal_key("M2");
        let report = publisher.publish_changes(&BTreeSet::new(), &store).await;
        assert_eq!(report.published, vec![MerchantId::new("M2")]);
        assert!(publisher.pending().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_the_batch() {
        let sink = InMemorySinkLog::new();
        let store = store_with(&[("M1", 10)]);
        let mut publisher = publisher(&sink).with_concurrency(1);
        sink.fail_next_writes(1);

        let report = publisher.publish_changes(&ids(&["M1"]), &store).await;

        assert_eq!(report.published.len(), 1);
        assert_eq!(sink.write_count(), 1);
    }

    #[tokio::test]
    async fn republish_all_covers_every_merchant() {
        let sink = InMemorySinkLog::new();
        let store = store_with(&[("a", 1), ("b", 2), ("c", 3)]);
        let mut publisher = publisher(&sink);

        let report = publisher.republish_all(&store).await;

        assert_eq!(report.published.len(), 3);
        assert_eq!(sink.latest().keys().cloned().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }
}
