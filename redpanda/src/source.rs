//! Positional reads from a Kafka-compatible topic.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tally_core::{
    FetchedBatch, PartitionId, SourceLog, SourceRecord, StartingOffsets, TransportError,
};
use tokio::sync::Mutex;
use tokio::time::Instant;

const DEFAULT_GROUP: &str = "tally-aggregator";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

struct PartitionReader {
    consumer: StreamConsumer,
    // Position the consumer will deliver next; `None` forces a re-assign.
    next: Option<i64>,
}

impl PartitionReader {
    fn seek(&mut self, topic: &str, partition: PartitionId, position: i64) -> Result<(), KafkaError> {
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::Offset(position))?;
        self.consumer.assign(&assignment)?;
        self.next = Some(position);
        tracing::debug!(topic, partition, position, "Assigned partition reader");
        Ok(())
    }
}

fn to_record(partition: PartitionId, message: &BorrowedMessage<'_>) -> SourceRecord {
    SourceRecord {
        partition,
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// [`SourceLog`] reading one topic with one manually assigned consumer per partition.
///
/// A fetch returns as soon as it has `max_records` records, reaches the end of the
/// partition, or the fetch timeout elapses, whichever comes first.
pub struct RedpandaSource {
    topic: String,
    consumer_config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    starting_offsets: StartingOffsets,
    fetch_timeout: Duration,
    metadata_timeout: Duration,
    readers: Mutex<HashMap<PartitionId, Arc<Mutex<PartitionReader>>>>,
}

impl RedpandaSource {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaSourceBuilder {
        RedpandaSourceBuilder::default()
    }

    /// The topic being read.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn fetch_failed(partition: PartitionId, reason: impl std::fmt::Display) -> TransportError {
        TransportError::FetchFailed {
            partition,
            reason: reason.to_string(),
        }
    }

    async fn reader(
        &self,
        partition: PartitionId,
    ) -> Result<Arc<Mutex<PartitionReader>>, TransportError> {
        let mut readers = self.readers.lock().await;
        if let Some(reader) = readers.get(&partition) {
            return Ok(Arc::clone(reader));
        }

        let consumer: StreamConsumer = self
            .consumer_config
            .create()
            .map_err(|e| Self::fetch_failed(partition, format!("failed to create consumer: {e}")))?;
        let reader = Arc::new(Mutex::new(PartitionReader {
            consumer,
            next: None,
        }));
        readers.insert(partition, Arc::clone(&reader));
        Ok(reader)
    }

    async fn starting_position(&self, partition: PartitionId) -> Result<i64, TransportError> {
        let metadata = Arc::clone(&self.metadata);
        let topic = self.topic.clone();
        let timeout = self.metadata_timeout;
        let (low, high) = tokio::task::spawn_blocking(move || {
            metadata.fetch_watermarks(&topic, partition, timeout)
        })
        .await
        .map_err(|e| Self::fetch_failed(partition, e))?
        .map_err(|e| Self::fetch_failed(partition, format!("failed to fetch watermarks: {e}")))?;

        let position = match self.starting_offsets {
            StartingOffsets::Earliest => low,
            StartingOffsets::Latest => high,
        };
        tracing::info!(
            topic = %self.topic,
            partition,
            policy = %self.starting_offsets,
            position,
            "Resolved starting position"
        );
        Ok(position)
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Option<i64>,
        max_records: usize,
    ) -> Result<FetchedBatch, TransportError> {
        let start = match from {
            Some(position) => position,
            None => self.starting_position(partition).await?,
        };

        let reader = self.reader(partition).await?;
        let mut reader = reader.lock().await;
        if reader.next != Some(start) {
            reader
                .seek(&self.topic, partition, start)
                .map_err(|e| Self::fetch_failed(partition, format!("failed to assign: {e}")))?;
        }

        let mut records = Vec::new();
        let deadline = Instant::now() + self.fetch_timeout;
        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let received = match tokio::time::timeout(remaining, reader.consumer.recv()).await {
                Err(_) | Ok(Err(KafkaError::PartitionEOF(_))) => None,
                Ok(Ok(message)) => Some(Ok(to_record(partition, &message))),
                Ok(Err(e)) => Some(Err(e)),
            };
            match received {
                None => break,
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => {
                    reader.next = None;
                    return Err(Self::fetch_failed(partition, e));
                }
            }
        }

        let next = records.last().map_or(start, |record| record.offset + 1);
        reader.next = Some(next);
        tracing::trace!(
            topic = %self.topic,
            partition,
            start,
            next,
            records = records.len(),
            "Fetched"
        );

        Ok(FetchedBatch {
            records,
            next_position: Some(next),
        })
    }
}

impl SourceLog for RedpandaSource {
    fn partitions(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<PartitionId>, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let metadata = Arc::clone(&self.metadata);
            let topic = self.topic.clone();
            let timeout = self.metadata_timeout;
            let unavailable = |reason: String| TransportError::MetadataUnavailable {
                topic: self.topic.clone(),
                reason,
            };

            let described = tokio::task::spawn_blocking(move || {
                metadata.fetch_metadata(Some(topic.as_str()), timeout).map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .find(|t| t.name() == topic)
                        .map(|t| {
                            (
                                t.error(),
                                t.partitions().iter().map(|p| p.id()).collect::<Vec<_>>(),
                            )
                        })
                })
            })
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

            match described {
                Some((None, mut partitions)) if !partitions.is_empty() => {
                    partitions.sort_unstable();
                    tracing::info!(topic = %self.topic, partitions = ?partitions, "Discovered partitions");
                    Ok(partitions)
                }
                Some((Some(error), _)) => Err(unavailable(format!("{error:?}"))),
                _ => Err(unavailable("topic has no partitions".to_string())),
            }
        })
    }

    fn fetch(
        &self,
        partition: PartitionId,
        from: Option<i64>,
        max_records: usize,
    ) -> Pin<Box<dyn Future<Output = Result<FetchedBatch, TransportError>> + Send + '_>> {
        Box::pin(self.read(partition, from, max_records))
    }
}

/// Builder for [`RedpandaSource`].
#[derive(Default)]
pub struct RedpandaSourceBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    starting_offsets: StartingOffsets,
    fetch_timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
}

impl RedpandaSourceBuilder {
    /// Comma-separated broker addresses (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic to read.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Consumer group id reported to the broker (default: `tally-aggregator`).
    ///
    /// Offsets are never committed to the broker; the id only labels the
    /// connection.
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Where to start partitions that have no recorded position.
    #[must_use]
    pub const fn starting_offsets(mut self, policy: StartingOffsets) -> Self {
        self.starting_offsets = policy;
        self
    }

    /// Longest a single fetch waits for records (default: 1 second).
    #[must_use]
    pub const fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Timeout for metadata and watermark queries (default: 10 seconds).
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaSource`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if brokers or topic are missing or
    /// the metadata client cannot be created.
    pub fn build(self) -> Result<RedpandaSource, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| TransportError::ConnectionFailed("Source topic not configured".to_string()))?;
        let group = self.consumer_group.unwrap_or_else(|| DEFAULT_GROUP.to_string());

        let mut consumer_config = ClientConfig::new();
        consumer_config
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "true")
            .set("session.timeout.ms", "6000");

        let metadata: BaseConsumer = consumer_config.create().map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to create metadata client: {e}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %group,
            starting_offsets = %self.starting_offsets,
            "RedpandaSource created"
        );

        Ok(RedpandaSource {
            topic,
            consumer_config,
            metadata: Arc::new(metadata),
            starting_offsets: self.starting_offsets,
            fetch_timeout: self.fetch_timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT),
            metadata_timeout: self.metadata_timeout.unwrap_or(DEFAULT_METADATA_TIMEOUT),
            readers: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_brokers_and_topic() {
        assert!(matches!(
            RedpandaSource::builder().topic("t").build(),
            Err(TransportError::ConnectionFailed(_))
        ));
        assert!(matches!(
            RedpandaSource::builder().brokers("localhost:9092").build(),
            Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn build_does_not_contact_brokers() {
        let source = RedpandaSource::builder()
            .brokers("localhost:1")
            .topic("transactions")
            .starting_offsets(StartingOffsets::Latest)
            .build();
        assert_eq!(source.map(|s| s.topic().to_string()).ok().as_deref(), Some("transactions"));
    }
}
