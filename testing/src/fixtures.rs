//! Transaction payloads in the producer's wire format.

use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Builder for one transaction record.
///
/// Starts from a complete, valid record; tests then remove or override fields to
/// produce the malformed variants they need.
///
/// # Example
///
/// ```
/// use tally_testing::TransactionFixture;
/// use serde_json::json;
///
/// let bad = TransactionFixture::new("M1", 10.0)
///     .with("amount", json!("abc"))
///     .to_value();
/// assert_eq!(bad["amount"], json!("abc"));
/// ```
#[derive(Debug, Clone)]
pub struct TransactionFixture {
    fields: Map<String, Value>,
}

impl TransactionFixture {
    /// A valid transaction of `amount` for `merchant`.
    #[must_use]
    pub fn new(merchant: &str, amount: f64) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let value = json!({
            "transactionId": format!("tx-{id}"),
            "userId": format!("user_{}", id % 100),
            "amount": amount,
            "transactionTime": 1_718_000_000_000_i64,
            "merchantId": merchant,
            "transactionType": "purchase",
            "location": "location_1",
            "paymentMethod": "credit_card",
            "isInternational": "false",
            "currency": "USD",
        });
        match value {
            Value::Object(fields) => Self { fields },
            _ => Self { fields: Map::new() },
        }
    }

    /// Set `field` to `value`.
    #[must_use]
    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }

    /// Remove `field`.
    #[must_use]
    pub fn without(mut self, field: &str) -> Self {
        self.fields.remove(field);
        self
    }

    /// The record as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// The record as wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        Value::Object(self.fields.clone()).to_string().into_bytes()
    }
}

/// Wire bytes of a valid transaction.
#[must_use]
pub fn transaction(merchant: &str, amount: f64) -> Vec<u8> {
    TransactionFixture::new(merchant, amount).to_bytes()
}
