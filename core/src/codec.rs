//! Record codec: raw JSON bytes to [`TransactionEvent`], aggregates to JSON bytes.
//!
//! # Wire format
//!
//! Input records are JSON objects carrying every field of the transaction schema:
//!
//! ```json
//! {
//!   "transactionId": "2f7c…", "userId": "user_12", "amount": 125.40,
//!   "transactionTime": 1718031234000, "merchantId": "merchant_2",
//!   "transactionType": "purchase", "location": "location_7",
//!   "paymentMethod": "credit_card", "isInternational": "false", "currency": "USD"
//! }
//! ```
//!
//! - Unknown fields are ignored; a missing or `null` field rejects the record.
//! - `amount` must be a JSON number and `transactionTime` a JSON integer. Numeric
//!   strings are rejected.
//! - String attributes accept any JSON scalar and keep its text, so producers that
//!   send `"isInternational": true` are still accepted.
//! - `transactionID` is accepted as an alias of `transactionId`.
//!
//! Output records are compact JSON, fields in a fixed order so identical aggregates
//! always produce identical bytes:
//!
//! ```json
//! {"merchantId":"merchant_2","totalAmount":15.5,"transactionCount":2}
//! ```

use crate::aggregate::AggregateState;
use crate::event::{MerchantId, SourcePosition, TransactionEvent};
use crate::log::{PartitionId, SourceRecord};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

/// Why a record was rejected by the codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    /// The payload is not valid JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The payload is JSON but not an object
    #[error("Record is not a JSON object")]
    NotAnObject,

    /// A required field is absent or null
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    /// A field has the wrong JSON type
    #[error("Field '{field}' must be {expected}")]
    WrongType {
        /// The offending field
        field: &'static str,
        /// Human-readable expected type
        expected: &'static str,
    },

    /// `merchantId` is present but empty
    #[error("Field 'merchantId' must not be empty")]
    EmptyMerchantId,

    /// `amount` cannot be represented as a decimal
    #[error("Amount '{0}' is outside the supported decimal range")]
    AmountOutOfRange(String),

    /// `transactionTime` does not map to a representable timestamp
    #[error("Transaction time {0} is outside the supported range")]
    TimestampOutOfRange(i64),
}

/// A rejected record, with enough context to find it in the source log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Rejected record at partition {partition} offset {offset}: {failure}")]
pub struct ParseError {
    /// Source partition of the record
    pub partition: PartitionId,
    /// Offset of the record
    pub offset: i64,
    /// The raw payload, unchanged
    pub payload: Vec<u8>,
    /// What was wrong with it
    pub failure: ParseFailure,
}

/// Parse a source record into a [`TransactionEvent`].
///
/// # Errors
///
/// Returns [`ParseError`] carrying the raw payload and its position when any field
/// is missing or ill-typed. No partial event is ever produced.
///
/// # Example
///
/// ```
/// use tally_core::codec;
/// use tally_core::SourceRecord;
///
/// let payload = br#"{"transactionId":"t1","userId":"u1","amount":10.5,
///     "transactionTime":1700000000000,"merchantId":"M1","transactionType":"purchase",
///     "location":"l1","paymentMethod":"card","isInternational":"false","currency":"USD"}"#;
/// let event = codec::parse(&SourceRecord::new(0, 7, payload.to_vec())).unwrap();
/// assert_eq!(event.merchant_id.as_str(), "M1");
/// assert_eq!(event.amount.to_string(), "10.5");
/// ```
pub fn parse(record: &SourceRecord) -> Result<TransactionEvent, ParseError> {
    let position = SourcePosition::new(record.partition, record.offset);
    decode(&record.payload, position).map_err(|failure| ParseError {
        partition: record.partition,
        offset: record.offset,
        payload: record.payload.clone(),
        failure,
    })
}

/// Decode raw bytes into a [`TransactionEvent`] read at `source`.
///
/// # Errors
///
/// Returns the first [`ParseFailure`] encountered.
pub fn decode(bytes: &[u8], source: SourcePosition) -> Result<TransactionEvent, ParseFailure> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ParseFailure::InvalidJson(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(ParseFailure::NotAnObject);
    };

    let transaction_id = match present(&fields, "transactionId") {
        Some(_) => scalar_text(&fields, "transactionId")?,
        None => scalar_text(&fields, "transactionID")
            .map_err(|_| ParseFailure::MissingField("transactionId"))?,
    };

    let amount = decimal(&fields, "amount")?;
    let transaction_time = integer(&fields, "transactionTime")?;
    let transaction_timestamp = TransactionEvent::derive_timestamp(transaction_time)
        .ok_or(ParseFailure::TimestampOutOfRange(transaction_time))?;

    let merchant_id = scalar_text(&fields, "merchantId")?;
    if merchant_id.trim().is_empty() {
        return Err(ParseFailure::EmptyMerchantId);
    }

    Ok(TransactionEvent {
        transaction_id,
        user_id: scalar_text(&fields, "userId")?,
        amount,
        transaction_time,
        transaction_timestamp,
        merchant_id: MerchantId::new(merchant_id),
        transaction_type: scalar_text(&fields, "transactionType")?,
        location: scalar_text(&fields, "location")?,
        payment_method: scalar_text(&fields, "paymentMethod")?,
        is_international: scalar_text(&fields, "isInternational")?,
        currency: scalar_text(&fields, "currency")?,
        source,
    })
}

fn present<'a>(fields: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    fields.get(field).filter(|v| !v.is_null())
}

fn scalar_text(fields: &Map<String, Value>, field: &'static str) -> Result<String, ParseFailure> {
    match present(fields, field) {
        None => Err(ParseFailure::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ParseFailure::WrongType {
            field,
            expected: "a string or scalar",
        }),
    }
}

fn decimal(fields: &Map<String, Value>, field: &'static str) -> Result<Decimal, ParseFailure> {
    let Some(value) = present(fields, field) else {
        return Err(ParseFailure::MissingField(field));
    };
    let Value::Number(number) = value else {
        return Err(ParseFailure::WrongType {
            field,
            expected: "a number",
        });
    };

    // The number's shortest textual form converts exactly; floats that serde_json
    // renders in exponent notation go through from_scientific.
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ParseFailure::AmountOutOfRange(text))
}

fn integer(fields: &Map<String, Value>, field: &'static str) -> Result<i64, ParseFailure> {
    match present(fields, field) {
        None => Err(ParseFailure::MissingField(field)),
        Some(value) => value.as_i64().ok_or(ParseFailure::WrongType {
            field,
            expected: "an integer",
        }),
    }
}

/// Exact decimal text for a JSON number, always with a fractional part.
fn json_decimal(amount: Decimal) -> String {
    let normalized = amount.normalize();
    if normalized.scale() == 0 {
        format!("{normalized}.0")
    } else {
        normalized.to_string()
    }
}

/// Serialize an aggregate for the downstream log.
///
/// `totalAmount` is written as the exact decimal text of the running total
/// (trailing zeros trimmed), so large totals keep every digit.
///
/// # Errors
///
/// Returns the underlying `serde_json` error if serialization fails.
///
/// # Example
///
/// ```
/// use tally_core::{codec, AggregateState, MerchantId};
///
/// let state = AggregateState::new(MerchantId::new("M2"));
/// let bytes = codec::encode_aggregate(&state).unwrap();
/// assert_eq!(bytes, br#"{"merchantId":"M2","totalAmount":0.0,"transactionCount":0}"#);
/// ```
pub fn encode_aggregate(state: &AggregateState) -> Result<Vec<u8>, serde_json::Error> {
    let merchant_id = serde_json::to_string(state.merchant_id.as_str())?;
    Ok(format!(
        r#"{{"merchantId":{merchant_id},"totalAmount":{},"transactionCount":{}}}"#,
        json_decimal(state.total_amount),
        state.transaction_count
    )
    .into_bytes())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregate::OffsetMark;
    use serde_json::json;

    fn full_event() -> Value {
        json!({
            "transactionId": "tx-1",
            "userId": "user_1",
            "amount": 10.5,
            "transactionTime": 1_700_000_000_123_i64,
            "merchantId": "merchant_1",
            "transactionType": "purchase",
            "location": "location_3",
            "paymentMethod": "credit_card",
            "isInternational": "true",
            "currency": "USD"
        })
    }

    fn decode_value(value: &Value) -> Result<TransactionEvent, ParseFailure> {
        let bytes = serde_json::to_vec(value).unwrap();
        decode(&bytes, SourcePosition::new(2, 40))
    }

    #[test]
    fn decodes_complete_record() {
        let event = decode_value(&full_event()).unwrap();

        assert_eq!(event.transaction_id, "tx-1");
        assert_eq!(event.amount, Decimal::from_str("10.5").unwrap());
        assert_eq!(event.transaction_timestamp.timestamp(), 1_700_000_000);
        assert_eq!(event.merchant_id, MerchantId::new("merchant_1"));
        assert_eq!(event.is_international(), Some(true));
        assert_eq!(event.source, SourcePosition::new(2, 40));
    }

    #[test]
    fn ignores_unknown_fields() {
        let mut value = full_event();
        value["riskScore"] = json!(0.93);
        assert!(decode_value(&value).is_ok());
    }

    #[test]
    fn rejects_string_amount() {
        let mut value = full_event();
        value["amount"] = json!("10.50");
        assert_eq!(
            decode_value(&value),
            Err(ParseFailure::WrongType { field: "amount", expected: "a number" })
        );
    }

    #[test]
    fn rejects_null_amount_as_missing() {
        let mut value = full_event();
        value["amount"] = Value::Null;
        assert_eq!(decode_value(&value), Err(ParseFailure::MissingField("amount")));
    }

    #[test]
    fn rejects_fractional_transaction_time() {
        let mut value = full_event();
        value["transactionTime"] = json!(1.5);
        assert!(matches!(
            decode_value(&value),
            Err(ParseFailure::WrongType { field: "transactionTime", .. })
        ));
    }

    #[test]
    fn rejects_missing_attribute() {
        let mut value = full_event();
        value.as_object_mut().unwrap().remove("currency");
        assert_eq!(decode_value(&value), Err(ParseFailure::MissingField("currency")));
    }

    #[test]
    fn rejects_empty_merchant() {
        let mut value = full_event();
        value["merchantId"] = json!("  ");
        assert_eq!(decode_value(&value), Err(ParseFailure::EmptyMerchantId));
    }

    #[test]
    fn accepts_producer_spelling_and_boolean_attributes() {
        let mut value = full_event();
        let fields = value.as_object_mut().unwrap();
        let id = fields.remove("transactionId").unwrap();
        fields.insert("transactionID".to_string(), id);
        fields.insert("paymentMethod".to_string(), json!(false));
        fields.insert("isInternational".to_string(), json!(true));

        let event = decode_value(&value).unwrap();
        assert_eq!(event.transaction_id, "tx-1");
        assert_eq!(event.payment_method, "false");
        assert_eq!(event.is_international(), Some(true));
    }

    #[test]
    fn rejects_object_attribute() {
        let mut value = full_event();
        value["location"] = json!({"city": "Lisbon"});
        assert!(matches!(
            decode_value(&value),
            Err(ParseFailure::WrongType { field: "location", .. })
        ));
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert_eq!(
            decode(b"[1,2,3]", SourcePosition::new(0, 0)),
            Err(ParseFailure::NotAnObject)
        );
        assert!(matches!(
            decode(b"{not json", SourcePosition::new(0, 0)),
            Err(ParseFailure::InvalidJson(_))
        ));
    }

    #[test]
    fn exponent_amounts_convert_exactly() {
        let mut value = full_event();
        value["amount"] = json!(1e-7);
        let event = decode_value(&value).unwrap();
        assert_eq!(event.amount, Decimal::from_str("0.0000001").unwrap());
    }

    #[test]
    fn huge_amount_is_out_of_range() {
        let mut value = full_event();
        value["amount"] = json!(1e40);
        assert!(matches!(decode_value(&value), Err(ParseFailure::AmountOutOfRange(_))));
    }

    #[test]
    fn parse_error_keeps_payload_and_position() {
        let record = SourceRecord::new(4, 99, b"garbage".to_vec());
        let err = parse(&record).unwrap_err();
        assert_eq!(err.partition, 4);
        assert_eq!(err.offset, 99);
        assert_eq!(err.payload, b"garbage".to_vec());
    }

    #[test]
    fn encoded_aggregate_is_byte_stable() {
        let state = AggregateState {
            merchant_id: MerchantId::new("M1"),
            total_amount: Decimal::from_str("15.50").unwrap(),
            transaction_count: 2,
            last_offset_mark: OffsetMark::new(4),
        };

        let first = encode_aggregate(&state).unwrap();
        let second = encode_aggregate(&state.clone()).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            String::from_utf8(first).unwrap(),
            r#"{"merchantId":"M1","totalAmount":15.5,"transactionCount":2}"#
        );
    }

    #[test]
    fn encoded_total_keeps_every_digit() {
        let total = Decimal::from_str("1000000000000.6000000000000001").unwrap();
        let state = AggregateState {
            merchant_id: MerchantId::new("M\"1"),
            total_amount: total,
            transaction_count: 3,
            last_offset_mark: OffsetMark::new(1),
        };

        let encoded = String::from_utf8(encode_aggregate(&state).unwrap()).unwrap();

        assert_eq!(
            encoded,
            r#"{"merchantId":"M\"1","totalAmount":1000000000000.6000000000000001,"transactionCount":3}"#
        );
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["merchantId"], "M\"1");
    }

    #[test]
    fn whole_and_negative_totals_are_json_numbers() {
        let mut state = AggregateState::new(MerchantId::new("M1"));
        state.total_amount = Decimal::from(100);
        let whole = String::from_utf8(encode_aggregate(&state).unwrap()).unwrap();
        assert!(whole.contains(r#""totalAmount":100.0,"#));

        state.total_amount = Decimal::from_str("-3.50").unwrap();
        let negative = String::from_utf8(encode_aggregate(&state).unwrap()).unwrap();
        assert!(negative.contains(r#""totalAmount":-3.5,"#));
        let value: Value = serde_json::from_str(&negative).unwrap();
        assert_eq!(value["totalAmount"], -3.5);
    }
}
