//! Incremental aggregation of one micro-batch.
//!
//! The engine applies `{amount, count = 1}` for every valid event to its merchant's
//! aggregate. Decimal addition rounds once a sum needs more than 28 significant
//! digits, so application order is fixed: partitions are decoded concurrently, one
//! worker each, and then applied one after another in the order they were given,
//! each in arrival order. A replay of the same batch therefore reproduces the same
//! totals.
//!
//! A bad record never aborts a batch: it becomes an [`Anomaly`], is handed to the
//! [`DeadLetterSink`], and the remaining records are still applied.

use crate::metrics::BatchMetrics;
use crate::store::AggregateStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tally_core::{
    AggregateDelta, Anomaly, DeadLetterSink, MerchantId, OffsetMark, ParseError, SourceRecord,
    TransactionEvent, codec,
};
use thiserror::Error;
use tokio::task::JoinSet;

/// Errors from running partition workers.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A decode or apply worker panicked or was cancelled
    #[error("Partition worker failed: {0}")]
    Worker(String),
}

/// What one batch did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Merchants whose aggregate changed
    pub changed: BTreeSet<MerchantId>,
    /// Events applied
    pub applied: usize,
    /// Records skipped, in source order
    pub anomalies: Vec<Anomaly>,
}

/// A decoded record, ready to apply.
enum Decoded {
    Event(TransactionEvent, Vec<u8>),
    Rejected(ParseError),
}

fn decode(records: Vec<SourceRecord>) -> Vec<Decoded> {
    records
        .into_iter()
        .map(|record| match codec::parse(&record) {
            Ok(event) => Decoded::Event(event, record.payload),
            Err(error) => Decoded::Rejected(error),
        })
        .collect()
}

/// Applies parsed events to an [`AggregateStore`].
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<AggregateStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl AggregationEngine {
    /// Create an engine writing to `store` and routing skipped records to
    /// `dead_letters`.
    #[must_use]
    pub fn new(store: Arc<AggregateStore>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            store,
            dead_letters,
        }
    }

    /// The store this engine writes to.
    #[must_use]
    pub const fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    /// Apply already-parsed events in order.
    ///
    /// Events that would overflow their merchant's aggregate are skipped and reported
    /// in [`BatchOutcome::anomalies`] without a payload; they are not routed.
    pub fn process_batch(&self, events: &[TransactionEvent], mark: OffsetMark) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for event in events {
            if let Err(anomaly) = self.apply_event(event, mark, &mut outcome) {
                outcome.anomalies.push(anomaly);
            }
        }
        outcome
    }

    /// Parse and apply raw records, routing every skipped record to the dead-letter
    /// sink.
    pub async fn ingest(&self, records: Vec<SourceRecord>, mark: OffsetMark) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        self.apply_decoded(decode(records), mark, &mut outcome).await;
        outcome
    }

    /// Decode each partition's records on its own worker, then apply the partitions
    /// in the order given.
    ///
    /// The aggregator passes partitions in ascending id order, so every run of a
    /// batch applies its events in the same sequence.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Worker`] if a worker panics. The store may then hold
    /// part of the batch, so the caller must not commit it.
    pub async fn ingest_partitions(
        &self,
        partitions: Vec<Vec<SourceRecord>>,
        mark: OffsetMark,
    ) -> Result<BatchOutcome, EngineError> {
        let mut decoders = JoinSet::new();
        for (index, records) in partitions.into_iter().enumerate() {
            if !records.is_empty() {
                decoders.spawn_blocking(move || (index, decode(records)));
            }
        }

        let mut decoded = Vec::with_capacity(decoders.len());
        while let Some(joined) = decoders.join_next().await {
            decoded.push(joined.map_err(|e| EngineError::Worker(e.to_string()))?);
        }
        decoded.sort_unstable_by_key(|(index, _)| *index);

        let engine = self.clone();
        tokio::spawn(async move {
            let mut outcome = BatchOutcome::default();
            for (_, records) in decoded {
                engine.apply_decoded(records, mark, &mut outcome).await;
            }
            outcome
        })
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))
    }

    async fn apply_decoded(
        &self,
        decoded: Vec<Decoded>,
        mark: OffsetMark,
        outcome: &mut BatchOutcome,
    ) {
        for record in decoded {
            let anomaly = match record {
                Decoded::Event(event, payload) => {
                    match self.apply_event(&event, mark, outcome) {
                        Ok(()) => continue,
                        Err(anomaly) => Anomaly { payload, ..anomaly },
                    }
                }
                Decoded::Rejected(error) => Anomaly::from(error),
            };

            tracing::debug!(
                partition = anomaly.partition,
                offset = anomaly.offset,
                kind = anomaly.kind.label(),
                "Record rejected"
            );
            BatchMetrics::record_rejected(anomaly.kind.label());
            self.dead_letters.route(&anomaly).await;
            outcome.anomalies.push(anomaly);
        }
    }

    fn apply_event(
        &self,
        event: &TransactionEvent,
        mark: OffsetMark,
        outcome: &mut BatchOutcome,
    ) -> Result<(), Anomaly> {
        match self
            .store
            .apply(&event.merchant_id, AggregateDelta::for_event(event), mark)
        {
            Ok(_) => {
                tracing::trace!(
                    merchant = %event.merchant_id,
                    source = %event.source,
                    amount = %event.amount,
                    "Applied event"
                );
                outcome.changed.insert(event.merchant_id.clone());
                outcome.applied += 1;
                Ok(())
            }
            Err(error) => {
                tracing::warn!(source = %event.source, error = %error, "Event overflows aggregate");
                Err(Anomaly::overflow(event, Vec::new()))
            }
        }
    }
}
