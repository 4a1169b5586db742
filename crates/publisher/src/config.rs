//! Producer stage configuration, read from prefixed environment variables
//! (e.g. `QUBIC_TRANSACTIONS_PUBLISHER_BATCH_SIZE=100`).

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

use crate::pool::FetchPolicy;

/// Per-stage defaults layered under the environment.
#[derive(Debug, Clone)]
pub struct StageDefaults {
    pub env_prefix: &'static str,
    pub kafka_topic: &'static str,
    pub metrics_namespace: &'static str,
    pub worker_count: usize,
    pub cadence: Duration,
}

impl StageDefaults {
    pub const TRANSACTIONS: Self = Self {
        env_prefix: "QUBIC_TRANSACTIONS_PUBLISHER",
        kafka_topic: "qubic-transactions",
        metrics_namespace: "qubic_transactions_publisher",
        worker_count: 20,
        cadence: Duration::from_secs(1),
    };

    pub const TICK_DATA: Self = Self {
        env_prefix: "QUBIC_TICK_DATA_PUBLISHER",
        kafka_topic: "qubic-tick-data",
        metrics_namespace: "qubic_tick_data_publisher",
        worker_count: 16,
        cadence: Duration::from_secs(1),
    };

    pub const TICK_INTERVALS: Self = Self {
        env_prefix: "QUBIC_TICK_INTERVALS_PUBLISHER",
        kafka_topic: "qubic-tick-intervals",
        metrics_namespace: "qubic_tick_intervals_publisher",
        worker_count: 1,
        cadence: Duration::from_secs(60),
    };

    pub const COMPUTORS: Self = Self {
        env_prefix: "QUBIC_COMPUTORS_PUBLISHER",
        kafka_topic: "qubic-computors",
        metrics_namespace: "qubic_computors_publisher",
        worker_count: 1,
        cadence: Duration::from_secs(24 * 60 * 60),
    };
}

/// Producer stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    pub archiver_host: String,
    pub archiver_timeout_secs: u64,
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub publish_timeout_secs: u64,
    pub store_dir: String,
    pub batch_size: usize,
    pub worker_count: usize,
    pub epoch_concurrency: usize,
    pub fetch_attempts: u32,
    pub cadence_secs: u64,
    pub override_epoch: Option<u32>,
    pub override_tick: Option<u32>,
    pub metrics_port: u16,
    pub metrics_namespace: String,
}

impl PublisherConfig {
    pub fn load(defaults: &StageDefaults) -> Result<Self, ConfigError> {
        Self::from_source(defaults, Environment::with_prefix(defaults.env_prefix))
    }

    /// Builds from an explicit environment source (tests pass a fixed map).
    pub fn from_source(defaults: &StageDefaults, env: Environment) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .set_default("archiver_host", "http://127.0.0.1:8000")?
            .set_default("archiver_timeout_secs", 20)?
            .set_default("kafka_brokers", "localhost:9092")?
            .set_default("kafka_topic", defaults.kafka_topic)?
            .set_default("publish_timeout_secs", 300)?
            .set_default("store_dir", "store")?
            .set_default("batch_size", 100)?
            .set_default("worker_count", defaults.worker_count as u64)?
            .set_default("epoch_concurrency", 4)?
            .set_default("fetch_attempts", 10)?
            .set_default("cadence_secs", defaults.cadence.as_secs())?
            .set_default("metrics_port", 9999)?
            .set_default("metrics_namespace", defaults.metrics_namespace)?
            .add_source(env.prefix_separator("_").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Message("worker_count must be > 0".into()));
        }
        if self.override_epoch.is_some() != self.override_tick.is_some() {
            return Err(ConfigError::Message(
                "override_epoch and override_tick must be set together".into(),
            ));
        }
        Ok(())
    }

    /// `(epoch, tick)` when an administrative cursor override is configured.
    pub fn cursor_override(&self) -> Option<(u32, u32)> {
        self.override_epoch.zip(self.override_tick)
    }

    pub fn archiver_timeout(&self) -> Duration {
        Duration::from_secs(self.archiver_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            attempts: self.fetch_attempts.max(1),
            timeout: self.archiver_timeout(),
            ..FetchPolicy::default()
        }
    }
}
