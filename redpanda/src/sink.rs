//! Keyed writes to a Kafka-compatible topic.

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tally_core::{SinkLog, TransportError};

/// [`SinkLog`] writing keyed records to one topic.
///
/// Records with the same key land on the same partition, so a downstream consumer
/// sees the updates of one merchant in order.
///
/// # Example
///
/// ```no_run
/// use tally_redpanda::RedpandaSink;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = RedpandaSink::builder()
///     .brokers("localhost:9092")
///     .topic("merchant-aggregates")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl RedpandaSink {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaSinkBuilder {
        RedpandaSinkBuilder::default()
    }

    /// The topic written to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl SinkLog for RedpandaSink {
    fn write(
        &self,
        key: &str,
        value: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let key = key.to_string();
        let value = value.to_vec();

        Box::pin(async move {
            let record = FutureRecord::to(&self.topic)
                .key(key.as_str())
                .payload(value.as_slice());

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::trace!(
                        topic = %self.topic,
                        key = %key,
                        partition,
                        offset,
                        "Record written"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::warn!(
                        topic = %self.topic,
                        key = %key,
                        error = %kafka_error,
                        "Failed to write record"
                    );
                    Err(TransportError::PublishFailed {
                        key,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}

/// Builder for [`RedpandaSink`].
#[derive(Default)]
pub struct RedpandaSinkBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaSinkBuilder {
    /// Comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic to write to.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Producer acknowledgment mode: `"1"` or `"all"` (default `"all"`).
    ///
    /// The idempotent producer is only enabled with `"all"`.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Delivery timeout per write (default: 5 seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaSink`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if brokers or topic are missing or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaSink, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| TransportError::ConnectionFailed("Sink topic not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let idempotent = acks == "all";

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("enable.idempotence", idempotent.to_string())
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            acks,
            idempotent,
            compression,
            "RedpandaSink created"
        );

        Ok(RedpandaSink {
            producer,
            topic,
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_topic() {
        assert!(matches!(
            RedpandaSink::builder().brokers("localhost:9092").build(),
            Err(TransportError::ConnectionFailed(reason)) if reason.contains("topic")
        ));
    }

    #[test]
    fn build_creates_producer_without_contacting_brokers() {
        let sink = RedpandaSink::builder()
            .brokers("localhost:1")
            .topic("merchant-aggregates")
            .producer_acks("1")
            .build();
        assert_eq!(
            sink.map(|s| s.topic().to_string()).ok().as_deref(),
            Some("merchant-aggregates")
        );
    }
}
