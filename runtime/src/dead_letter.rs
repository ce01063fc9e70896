//! Dead-letter sink that writes anomalies to a dedicated log topic.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tally_core::{Anomaly, DeadLetterSink, PartitionId, SinkLog};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnomalyRecord<'a> {
    partition: PartitionId,
    offset: i64,
    kind: &'static str,
    detail: String,
    payload: std::borrow::Cow<'a, str>,
    routed_at: chrono::DateTime<Utc>,
}

/// Writes each anomaly as a JSON record keyed `<partition>-<offset>`.
///
/// Best effort: a failed write is logged and the anomaly dropped, so a broken
/// anomalies topic never stalls aggregation.
pub struct TopicDeadLetters {
    sink: Arc<dyn SinkLog>,
}

impl TopicDeadLetters {
    /// Route anomalies to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn SinkLog>) -> Self {
        Self { sink }
    }

    /// Encode `anomaly` as it is written to the topic.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error if encoding fails.
    pub fn encode(anomaly: &Anomaly) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&AnomalyRecord {
            partition: anomaly.partition,
            offset: anomaly.offset,
            kind: anomaly.kind.label(),
            detail: anomaly.kind.detail(),
            payload: String::from_utf8_lossy(&anomaly.payload),
            routed_at: Utc::now(),
        })
    }
}

impl DeadLetterSink for TopicDeadLetters {
    fn route<'a>(&'a self, anomaly: &'a Anomaly) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let key = anomaly.key();
            let result = match Self::encode(anomaly) {
                Ok(value) => self.sink.write(&key, &value).await,
                Err(e) => {
                    tracing::warn!(key, error = %e, "Failed to encode anomaly");
                    return;
                }
            };

            match result {
                Ok(()) => tracing::debug!(key, kind = anomaly.kind.label(), "Routed anomaly"),
                Err(e) => tracing::warn!(key, error = %e, "Failed to route anomaly, dropping"),
            }
        })
    }
}
