//! Consumer and status-service configuration from prefixed environment
//! variables (`QUBIC_ELASTIC_CONSUMER_*`, `QUBIC_STATUS_SERVICE_*`).

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use qubic_publisher::pool::FetchPolicy;

use crate::elastic::RetryPolicy;

pub const CONSUMER_ENV_PREFIX: &str = "QUBIC_ELASTIC_CONSUMER";
pub const STATUS_ENV_PREFIX: &str = "QUBIC_STATUS_SERVICE";

/// Payload stream a consumer drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stream {
    Transactions,
    TickData,
    TickIntervals,
    Computors,
}

impl Stream {
    pub fn default_topic(self) -> &'static str {
        match self {
            Stream::Transactions => "qubic-transactions",
            Stream::TickData => "qubic-tick-data",
            Stream::TickIntervals => "qubic-tick-intervals",
            Stream::Computors => "qubic-computors",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Transactions => "transactions",
            Stream::TickData => "tick-data",
            Stream::TickIntervals => "tick-intervals",
            Stream::Computors => "computors",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConsumerConfig {
    stream: Stream,
    kafka_brokers: String,
    kafka_topic: Option<String>,
    kafka_group: String,
    batch_size: usize,
    poll_timeout_secs: u64,
    elastic_url: String,
    elastic_index: Option<String>,
    elastic_username: Option<String>,
    elastic_password: Option<String>,
    elastic_max_retries: u32,
    elastic_timeout_secs: u64,
    metrics_port: u16,
    metrics_namespace: String,
}

/// Kafka → Elasticsearch consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: Stream,
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group: String,
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub elastic_url: String,
    pub elastic_index: String,
    pub elastic_username: Option<String>,
    pub elastic_password: Option<String>,
    pub elastic_max_retries: u32,
    pub elastic_timeout: Duration,
    pub metrics_port: u16,
    pub metrics_namespace: String,
}

impl ConsumerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_source(Environment::with_prefix(CONSUMER_ENV_PREFIX))
    }

    pub fn from_source(env: Environment) -> Result<Self, ConfigError> {
        let raw: RawConsumerConfig = Config::builder()
            .set_default("kafka_brokers", "localhost:9092")?
            .set_default("kafka_group", "qubic-elastic")?
            .set_default("batch_size", 1000)?
            .set_default("poll_timeout_secs", 5)?
            .set_default("elastic_url", "http://localhost:9200")?
            .set_default("elastic_max_retries", 15)?
            .set_default("elastic_timeout_secs", 30)?
            .set_default("metrics_port", 9999)?
            .set_default("metrics_namespace", "qubic_elastic_consumer")?
            .add_source(env.prefix_separator("_").try_parsing(true))
            .build()?
            .try_deserialize()?;
        if raw.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be > 0".into()));
        }
        let default_topic = raw.stream.default_topic();
        Ok(Self {
            stream: raw.stream,
            kafka_brokers: raw.kafka_brokers,
            kafka_topic: raw.kafka_topic.unwrap_or_else(|| default_topic.to_string()),
            kafka_group: raw.kafka_group,
            batch_size: raw.batch_size,
            poll_timeout: Duration::from_secs(raw.poll_timeout_secs),
            elastic_url: raw.elastic_url,
            elastic_index: raw.elastic_index.unwrap_or_else(|| default_topic.to_string()),
            elastic_username: raw.elastic_username,
            elastic_password: raw.elastic_password,
            elastic_max_retries: raw.elastic_max_retries,
            elastic_timeout: Duration::from_secs(raw.elastic_timeout_secs),
            metrics_port: raw.metrics_port,
            metrics_namespace: raw.metrics_namespace,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.elastic_max_retries,
            ..RetryPolicy::default()
        }
    }
}

/// Status service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    pub archiver_host: String,
    pub archiver_timeout_secs: u64,
    pub elastic_url: String,
    pub elastic_transactions_index: String,
    pub elastic_intervals_index: String,
    pub elastic_username: Option<String>,
    pub elastic_password: Option<String>,
    pub elastic_max_retries: u32,
    pub elastic_timeout_secs: u64,
    pub store_dir: String,
    pub batch_size: usize,
    pub worker_count: usize,
    pub verify_attempts: u32,
    pub lag_cycles: u32,
    pub cache_ttl_secs: u64,
    pub status_cache_ttl_secs: u64,
    pub http_port: u16,
    pub metrics_namespace: String,
}

impl StatusConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_source(Environment::with_prefix(STATUS_ENV_PREFIX))
    }

    pub fn from_source(env: Environment) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .set_default("archiver_host", "http://127.0.0.1:8000")?
            .set_default("archiver_timeout_secs", 20)?
            .set_default("elastic_url", "http://localhost:9200")?
            .set_default("elastic_transactions_index", "qubic-transactions")?
            .set_default("elastic_intervals_index", "qubic-tick-intervals")?
            .set_default("elastic_max_retries", 15)?
            .set_default("elastic_timeout_secs", 30)?
            .set_default("store_dir", "store")?
            .set_default("batch_size", 100)?
            .set_default("worker_count", 16)?
            .set_default("verify_attempts", 3)?
            .set_default("lag_cycles", 60)?
            .set_default("cache_ttl_secs", 60)?
            .set_default("status_cache_ttl_secs", 1)?
            .set_default("http_port", 8000)?
            .set_default("metrics_namespace", "qubic_status_service")?
            .add_source(env.prefix_separator("_").try_parsing(true))
            .build()?
            .try_deserialize()?;
        if config.batch_size == 0 || config.worker_count == 0 {
            return Err(ConfigError::Message(
                "batch_size and worker_count must be > 0".into(),
            ));
        }
        Ok(config)
    }

    pub fn archiver_timeout(&self) -> Duration {
        Duration::from_secs(self.archiver_timeout_secs)
    }

    pub fn elastic_timeout(&self) -> Duration {
        Duration::from_secs(self.elastic_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.elastic_max_retries,
            ..RetryPolicy::default()
        }
    }

    /// Per-tick fetch policy of the verification pool; mismatches are retried
    /// by the sync itself, so each fetch gets a single attempt.
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            attempts: 1,
            timeout: self.archiver_timeout(),
            ..FetchPolicy::default()
        }
    }
}
