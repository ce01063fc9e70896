//! Configuration for the `tally` binary.
//!
//! Loaded from `TALLY_*` environment variables, optionally seeded from a `.env`
//! file. Unset or empty variables take the defaults below; a value that is set but
//! invalid is an error naming the variable.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tally_core::StartingOffsets;
use tally_runtime::Trigger;
use thiserror::Error;

const DEFAULT_BROKERS: &str = "kafka-broker-1:19092,kafka-broker-2:19092,kafka-broker-3:19092";
const DEFAULT_SOURCE_TOPIC: &str = "financial_transactions";
const DEFAULT_AGGREGATES_TOPIC: &str = "transaction_aggregates";
const DEFAULT_CONSUMER_GROUP: &str = "tally-aggregator";
const DEFAULT_CHECKPOINT_DIR: &str = "/var/lib/tally/checkpoints";
const DEFAULT_PIPELINE: &str = "merchant-totals";

const ACKS: &[&str] = &["0", "1", "all"];
const COMPRESSION: &[&str] = &["none", "gzip", "snappy", "lz4", "zstd"];

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value '{value}' for {var}: {reason}")]
pub struct ConfigError {
    /// The offending environment variable
    pub var: &'static str,
    /// The value it was set to
    pub value: String,
    /// Why the value was rejected
    pub reason: String,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Broker and topic settings
    pub redpanda: RedpandaConfig,
    /// Where checkpoints are kept
    pub checkpoint: CheckpointConfig,
    /// Micro-batch tuning
    pub aggregator: AggregatorConfig,
    /// Prometheus endpoint; `None` disables it
    pub metrics_addr: Option<SocketAddr>,
}

/// Kafka-compatible broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedpandaConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Topic carrying transaction events
    pub source_topic: String,
    /// Topic receiving merchant aggregates
    pub aggregates_topic: String,
    /// Topic receiving skipped records; `None` logs and discards them
    pub anomalies_topic: Option<String>,
    /// Consumer group id reported to the broker
    pub consumer_group: String,
    /// Where partitions without a checkpointed position start
    pub starting_offsets: StartingOffsets,
    /// Longest a single partition fetch waits for records
    pub fetch_timeout: Duration,
    /// Producer acknowledgment mode
    pub producer_acks: String,
    /// Producer compression codec
    pub compression: String,
}

/// Checkpoint storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointLocation {
    /// One file per checkpoint in a local directory
    Directory(PathBuf),
    /// Rows in a `PostgreSQL` table
    Postgres(String),
}

impl FromStr for CheckpointLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            Ok(Self::Postgres(s.to_string()))
        } else if s.contains("://") {
            Err("expected a directory path or a postgres:// URL".to_string())
        } else {
            Ok(Self::Directory(PathBuf::from(s)))
        }
    }
}

/// Checkpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Storage backend
    pub location: CheckpointLocation,
    /// Checkpoints kept after each commit
    pub retain: usize,
    /// Name checkpoints are stored under (`PostgreSQL` only)
    pub pipeline: String,
}

/// Micro-batch tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// When batches run
    pub trigger: Trigger,
    /// State store shards
    pub state_shards: usize,
    /// Cap on records per partition per batch
    pub max_records_per_partition: usize,
    /// Retries for a checkpoint commit before halting
    pub commit_max_retries: usize,
    /// Retries for one downstream write before it is carried over
    pub publish_max_retries: usize,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first variable holding an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first variable holding an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let redpanda = RedpandaConfig {
            brokers: env.string("TALLY_BROKERS", DEFAULT_BROKERS),
            source_topic: env.string("TALLY_SOURCE_TOPIC", DEFAULT_SOURCE_TOPIC),
            aggregates_topic: env.string("TALLY_AGGREGATES_TOPIC", DEFAULT_AGGREGATES_TOPIC),
            anomalies_topic: env.get("TALLY_ANOMALIES_TOPIC"),
            consumer_group: env.string("TALLY_CONSUMER_GROUP", DEFAULT_CONSUMER_GROUP),
            starting_offsets: env.parse("TALLY_STARTING_OFFSETS", StartingOffsets::Earliest)?,
            fetch_timeout: env.millis("TALLY_FETCH_TIMEOUT_MS", 1_000)?,
            producer_acks: env.one_of("TALLY_PRODUCER_ACKS", ACKS, "all")?,
            compression: env.one_of("TALLY_COMPRESSION", COMPRESSION, "none")?,
        };

        let checkpoint = CheckpointConfig {
            location: env.parse(
                "TALLY_CHECKPOINT_LOCATION",
                CheckpointLocation::Directory(PathBuf::from(DEFAULT_CHECKPOINT_DIR)),
            )?,
            retain: env.positive("TALLY_CHECKPOINT_RETAIN", 5)?,
            pipeline: env.string("TALLY_PIPELINE_NAME", DEFAULT_PIPELINE),
        };

        let interval = env.millis("TALLY_TRIGGER_INTERVAL_MS", 0)?;
        let trigger = if interval.is_zero() {
            Trigger::Continuous {
                idle: env.millis("TALLY_IDLE_BACKOFF_MS", 500)?,
            }
        } else {
            Trigger::Interval(interval)
        };

        let aggregator = AggregatorConfig {
            trigger,
            state_shards: env.positive("TALLY_PARTITIONS", 20)?,
            max_records_per_partition: env.positive("TALLY_MAX_RECORDS_PER_PARTITION", 10_000)?,
            commit_max_retries: env.parse("TALLY_COMMIT_MAX_RETRIES", 5)?,
            publish_max_retries: env.parse("TALLY_PUBLISH_MAX_RETRIES", 3)?,
        };

        Ok(Self {
            redpanda,
            checkpoint,
            aggregator,
            metrics_addr: env.optional("TALLY_METRICS_ADDR")?,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn optional<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(var)
            .map(|value| {
                value.parse().map_err(|e: T::Err| ConfigError {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.optional(var)?.unwrap_or(default))
    }

    fn positive(&self, var: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse(var, default)?;
        if value == 0 {
            return Err(ConfigError {
                var,
                value: value.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(value)
    }

    fn millis(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(var, default).map(Duration::from_millis)
    }

    fn one_of(
        &self,
        var: &'static str,
        allowed: &[&str],
        default: &str,
    ) -> Result<String, ConfigError> {
        let value = self.string(var, default).to_ascii_lowercase();
        if allowed.contains(&value.as_str()) {
            Ok(value)
        } else {
            Err(ConfigError {
                var,
                reason: format!("expected one of {}", allowed.join(", ")),
                value,
            })
        }
    }
}
