//! Transaction events consumed from the source log.
//!
//! A [`TransactionEvent`] is ephemeral: it exists between the codec and the
//! aggregation engine and is never persisted. Only `merchant_id` and `amount`
//! drive aggregation; the remaining attributes are carried for diagnostics and
//! dead-letter records.

use crate::log::PartitionId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Merchant identifier, the aggregation and partitioning key.
///
/// # Example
///
/// ```
/// use tally_core::MerchantId;
///
/// let merchant = MerchantId::new("merchant_1");
/// assert_eq!(merchant.as_str(), "merchant_1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MerchantId(String);

impl MerchantId {
    /// Create a merchant identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MerchantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where a record was read from: source partition and offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Source partition
    pub partition: PartitionId,
    /// Offset of the record within the partition
    pub offset: i64,
}

impl SourcePosition {
    /// Create a position.
    #[must_use]
    pub const fn new(partition: PartitionId, offset: i64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// One financial transaction, validated against the transaction schema.
///
/// `transaction_id` is opaque and is not used for deduplication: the engine relies on
/// offsets and checkpoints, not on event identity, for exactly-once-effective output.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    /// Opaque transaction identifier
    pub transaction_id: String,
    /// Paying user
    pub user_id: String,
    /// Signed amount in the transaction currency
    pub amount: Decimal,
    /// Event time in epoch milliseconds, as sent by the producer
    pub transaction_time: i64,
    /// Event time derived from `transaction_time` at seconds resolution
    pub transaction_timestamp: DateTime<Utc>,
    /// Aggregation key
    pub merchant_id: MerchantId,
    /// Transaction kind (e.g. `purchase`, `refund`)
    pub transaction_type: String,
    /// Free-form location attribute
    pub location: String,
    /// Payment method attribute
    pub payment_method: String,
    /// Whether the transaction crossed borders, as the producer encoded it
    pub is_international: String,
    /// ISO currency code
    pub currency: String,
    /// Where this event was read from
    pub source: SourcePosition,
}

impl TransactionEvent {
    /// Derive the event timestamp from epoch milliseconds.
    ///
    /// The value is divided by 1000 and interpreted at seconds resolution, matching
    /// how the pipeline has always derived `transactionTimestamp`. Returns `None` if
    /// the result is outside the representable range.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_core::TransactionEvent;
    ///
    /// let ts = TransactionEvent::derive_timestamp(1_700_000_000_999).unwrap();
    /// assert_eq!(ts.timestamp(), 1_700_000_000);
    /// ```
    #[must_use]
    pub fn derive_timestamp(epoch_millis: i64) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(epoch_millis.div_euclid(1000), 0)
    }

    /// Interpret `is_international` as a boolean when it holds `true`/`false`.
    #[must_use]
    pub fn is_international(&self) -> Option<bool> {
        match self.is_international.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_truncates_to_seconds() {
        let ts = TransactionEvent::derive_timestamp(1_500).map(|t| t.timestamp());
        assert_eq!(ts, Some(1));
    }

    #[test]
    fn negative_millis_round_down() {
        let ts = TransactionEvent::derive_timestamp(-1).map(|t| t.timestamp());
        assert_eq!(ts, Some(-1));
    }

    #[test]
    fn out_of_range_timestamp_is_none() {
        assert!(TransactionEvent::derive_timestamp(i64::MAX).is_none());
    }

    #[test]
    fn merchant_id_orders_lexicographically() {
        let mut ids = vec![MerchantId::new("m2"), MerchantId::new("m10"), MerchantId::new("m1")];
        ids.sort();
        let sorted: Vec<&str> = ids.iter().map(MerchantId::as_str).collect();
        assert_eq!(sorted, vec!["m1", "m10", "m2"]);
    }
}
