//! Integration tests for [`RedpandaSource`] and [`RedpandaSink`] against a real Kafka
//! broker.
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require Docker
//! (for testcontainers) and take 15-60 seconds to start the broker.
//!
//! ```bash
//! cargo test -p tally-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tally_core::{SinkLog, SourceLog, StartingOffsets};
use tally_redpanda::{RedpandaSink, RedpandaSource};
use tally_runtime::Aggregator;
use tally_testing::{InMemoryCheckpointStore, transaction};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn sink(brokers: &str, topic: &str) -> RedpandaSink {
    RedpandaSink::builder()
        .brokers(brokers)
        .topic(topic)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("Failed to create sink")
}

fn source(brokers: &str, topic: &str) -> RedpandaSource {
    RedpandaSource::builder()
        .brokers(brokers)
        .topic(topic)
        .starting_offsets(StartingOffsets::Earliest)
        .fetch_timeout(Duration::from_secs(2))
        .build()
        .expect("Failed to create source")
}

/// Write until the broker accepts, which also auto-creates the topic.
async fn write_with_warmup(sink: &RedpandaSink, key: &str, value: &[u8]) {
    for attempt in 1..=60 {
        if sink.write(key, value).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Kafka did not accept writes");
    }
}

async fn read_all(source: &RedpandaSource) -> Vec<(Option<Vec<u8>>, Vec<u8>)> {
    let mut records = Vec::new();
    for partition in source.partitions().await.expect("partitions") {
        let mut position = None;
        loop {
            let batch = source.fetch(partition, position, 100).await.expect("fetch");
            if batch.records.is_empty() {
                break;
            }
            position = batch.next_position;
            records.extend(batch.records.into_iter().map(|r| (r.key, r.payload)));
        }
    }
    records
}

#[tokio::test]
#[ignore]
async fn source_reads_from_requested_positions() {
    let (_kafka, brokers) = start_kafka().await;
    let writer = sink(&brokers, "positional");
    for i in 0..5 {
        write_with_warmup(&writer, "same-key", format!("{i}").as_bytes()).await;
    }

    let reader = source(&brokers, "positional");
    let partitions = reader.partitions().await.expect("partitions");
    assert_eq!(partitions, vec![0]);

    let all = reader.fetch(0, None, 100).await.expect("fetch");
    assert_eq!(all.records.len(), 5);
    assert_eq!(all.next_position, Some(5));

    // Re-reading an earlier range returns the same records.
    let again = reader.fetch(0, Some(2), 2).await.expect("fetch");
    let offsets: Vec<i64> = again.records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![2, 3]);
    assert_eq!(again.records[0].payload, b"2");
    assert_eq!(again.next_position, Some(4));

    let end = reader.fetch(0, Some(5), 10).await.expect("fetch");
    assert!(end.records.is_empty());
    assert_eq!(end.next_position, Some(5));
}

#[tokio::test]
#[ignore]
async fn aggregates_round_trip_through_kafka() {
    let (_kafka, brokers) = start_kafka().await;
    let producer = sink(&brokers, "transactions");
    write_with_warmup(&producer, "M1", &transaction("M1", 10.00)).await;
    write_with_warmup(&producer, "M1", &transaction("M1", 5.50)).await;
    write_with_warmup(&producer, "M2", &transaction("M2", 100.00)).await;

    let mut aggregator = Aggregator::builder()
        .source(source(&brokers, "transactions"))
        .sink(sink(&brokers, "merchant-aggregates"))
        .checkpoints(InMemoryCheckpointStore::new())
        .recover()
        .await
        .expect("recover");

    let mut applied = 0;
    for _ in 0..10 {
        applied += aggregator.run_batch().await.expect("batch").applied;
        if applied == 3 {
            break;
        }
    }
    assert_eq!(applied, 3);

    let latest: BTreeMap<String, Value> = read_all(&source(&brokers, "merchant-aggregates"))
        .await
        .into_iter()
        .map(|(key, payload)| {
            (
                String::from_utf8(key.expect("keyed")).unwrap(),
                serde_json::from_slice(&payload).unwrap(),
            )
        })
        .collect();

    assert_eq!(latest["M1"]["transactionCount"], 2);
    assert_eq!(latest["M1"]["totalAmount"], 15.5);
    assert_eq!(latest["M2"]["totalAmount"], 100.0);
}
