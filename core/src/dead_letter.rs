//! Dead-letter routing for records that cannot be aggregated.
//!
//! An [`Anomaly`] is produced for every record the engine skips: payloads the codec
//! rejects, and valid events whose amount would overflow the merchant's running total.
//! Routing is best effort and never blocks or fails a batch.

use crate::codec::{ParseError, ParseFailure};
use crate::event::{MerchantId, TransactionEvent};
use crate::log::PartitionId;
use std::future::Future;
use std::pin::Pin;

/// Why a record was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyKind {
    /// The payload failed schema validation
    Malformed(ParseFailure),
    /// Applying the event would overflow the merchant's aggregate
    Overflow {
        /// Affected merchant
        merchant_id: MerchantId,
        /// Transaction that was skipped
        transaction_id: String,
    },
}

impl AnomalyKind {
    /// Short machine-readable label, used in logs and dead-letter records.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Overflow { .. } => "overflow",
        }
    }

    /// Human-readable detail.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Malformed(failure) => failure.to_string(),
            Self::Overflow { merchant_id, transaction_id } => {
                format!("transaction '{transaction_id}' overflows aggregate for '{merchant_id}'")
            }
        }
    }
}

/// A skipped record, with its source position and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    /// Source partition
    pub partition: PartitionId,
    /// Offset within the partition
    pub offset: i64,
    /// Raw payload, when available
    pub payload: Vec<u8>,
    /// What went wrong
    pub kind: AnomalyKind,
}

impl Anomaly {
    /// Key used when writing the anomaly to a keyed log: `<partition>-<offset>`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}-{}", self.partition, self.offset)
    }

    /// An overflow anomaly for `event`, keeping its original payload.
    #[must_use]
    pub fn overflow(event: &TransactionEvent, payload: Vec<u8>) -> Self {
        Self {
            partition: event.source.partition,
            offset: event.source.offset,
            payload,
            kind: AnomalyKind::Overflow {
                merchant_id: event.merchant_id.clone(),
                transaction_id: event.transaction_id.clone(),
            },
        }
    }
}

impl From<ParseError> for Anomaly {
    fn from(error: ParseError) -> Self {
        Self {
            partition: error.partition,
            offset: error.offset,
            payload: error.payload,
            kind: AnomalyKind::Malformed(error.failure),
        }
    }
}

/// Destination for skipped records.
pub trait DeadLetterSink: Send + Sync {
    /// Route one anomaly. Failures are handled (logged) by the implementation.
    fn route<'a>(&'a self, anomaly: &'a Anomaly) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Logs each anomaly at `warn` and drops it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardDeadLetters;

impl DeadLetterSink for DiscardDeadLetters {
    fn route<'a>(&'a self, anomaly: &'a Anomaly) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            tracing::warn!(
                partition = anomaly.partition,
                offset = anomaly.offset,
                kind = anomaly.kind.label(),
                detail = %anomaly.kind.detail(),
                "Skipping record"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_converts_to_malformed_anomaly() {
        let error = ParseError {
            partition: 3,
            offset: 17,
            payload: b"{}".to_vec(),
            failure: ParseFailure::MissingField("amount"),
        };

        let anomaly = Anomaly::from(error);

        assert_eq!(anomaly.key(), "3-17");
        assert_eq!(anomaly.kind.label(), "malformed");
        assert_eq!(anomaly.kind.detail(), "Missing required field 'amount'");
        assert_eq!(anomaly.payload, b"{}".to_vec());
    }

    #[test]
    fn overflow_detail_names_merchant_and_transaction() {
        let kind = AnomalyKind::Overflow {
            merchant_id: MerchantId::new("M9"),
            transaction_id: "tx-9".to_string(),
        };
        assert_eq!(kind.label(), "overflow");
        assert!(kind.detail().contains("M9"));
        assert!(kind.detail().contains("tx-9"));
    }
}
