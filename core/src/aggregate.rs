//! Running per-merchant aggregates.

use crate::event::{MerchantId, TransactionEvent};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from applying a delta to an aggregate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The running total would leave the representable decimal range
    #[error("Total amount overflow for merchant '{merchant_id}'")]
    AmountOverflow {
        /// Merchant whose total overflowed
        merchant_id: MerchantId,
    },

    /// The running count would overflow
    #[error("Transaction count overflow for merchant '{merchant_id}'")]
    CountOverflow {
        /// Merchant whose count overflowed
        merchant_id: MerchantId,
    },
}

/// Opaque position marker stored on each aggregate.
///
/// Holds the checkpoint version of the batch that last changed the aggregate, so an
/// operator can tell which commit a published value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetMark(u64);

impl OffsetMark {
    /// Create a marker for the given checkpoint version.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// The checkpoint version this marker refers to.
    #[must_use]
    pub const fn version(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OffsetMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The change one event makes to its merchant's aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateDelta {
    /// Amount added to the running total
    pub amount: Decimal,
    /// Transactions added to the running count
    pub count: u64,
}

impl AggregateDelta {
    /// The delta contributed by a single event: its amount and a count of one.
    #[must_use]
    pub const fn for_event(event: &TransactionEvent) -> Self {
        Self {
            amount: event.amount,
            count: 1,
        }
    }
}

/// Running aggregate for one merchant.
///
/// Created on the first event for a merchant and never evicted. The total uses
/// `Decimal` so that millions of additions of fractional currency amounts stay exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Aggregation key
    pub merchant_id: MerchantId,
    /// Sum of all applied amounts
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    /// Number of applied transactions
    pub transaction_count: u64,
    /// Checkpoint version of the batch that last changed this aggregate
    pub last_offset_mark: OffsetMark,
}

impl AggregateState {
    /// An empty aggregate for `merchant_id`.
    #[must_use]
    pub const fn new(merchant_id: MerchantId) -> Self {
        Self {
            merchant_id,
            total_amount: Decimal::ZERO,
            transaction_count: 0,
            last_offset_mark: OffsetMark::new(0),
        }
    }

    /// Apply `delta`, leaving `self` untouched on overflow.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] if the total or the count would overflow.
    pub fn apply(&mut self, delta: AggregateDelta, mark: OffsetMark) -> Result<(), StateError> {
        let total = self.total_amount.checked_add(delta.amount).ok_or_else(|| {
            StateError::AmountOverflow {
                merchant_id: self.merchant_id.clone(),
            }
        })?;
        let count = self.transaction_count.checked_add(delta.count).ok_or_else(|| {
            StateError::CountOverflow {
                merchant_id: self.merchant_id.clone(),
            }
        })?;

        self.total_amount = total;
        self.transaction_count = count;
        self.last_offset_mark = mark;
        Ok(())
    }
}
