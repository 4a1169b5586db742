//! Kafka publication.
//!
//! [RecordSink::publish] succeeds only when every record of the batch has been
//! acknowledged. The Kafka implementation enqueues the whole batch on an async
//! producer (zstd batch compression) and then waits for every delivery report.

use async_trait::async_trait;
use futures_util::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("{failed} of {total} records not acknowledged, first error: {first}")]
    Unacknowledged {
        failed: usize,
        total: usize,
        first: String,
    },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// One keyed Kafka record with a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn json<T: Serialize>(key: &[u8], value: &T) -> Result<Self, PublishError> {
        Ok(Self {
            key: key.to_vec(),
            payload: serde_json::to_vec(value)?,
        })
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// All-or-nothing acknowledgement of `records`.
    async fn publish(&self, records: Vec<Record>) -> Result<(), PublishError>;
}

/// Kafka producer bound to one topic.
pub struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaSink {
    /// `timeout` bounds both per-record delivery and the whole batch wait.
    pub fn new(brokers: &str, topic: impl Into<String>, timeout: Duration) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("compression.type", "zstd")
            .set("linger.ms", "20")
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .create()?;
        Ok(Self {
            producer,
            topic: topic.into(),
            timeout,
        })
    }

    /// Flushes in-flight deliveries; used on shutdown.
    pub fn flush(&self) -> Result<(), PublishError> {
        self.producer.flush(Timeout::After(self.timeout))?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn publish(&self, records: Vec<Record>) -> Result<(), PublishError> {
        let total = records.len();
        let deliveries = records.iter().map(|r| {
            self.producer.send(
                FutureRecord::to(&self.topic).key(&r.key).payload(&r.payload),
                Timeout::After(self.timeout),
            )
        });
        let results = tokio::time::timeout(self.timeout, join_all(deliveries))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?;
        let errors: Vec<KafkaError> = results
            .into_iter()
            .filter_map(|r| r.err().map(|(e, _)| e))
            .collect();
        if let Some(first) = errors.first() {
            tracing::error!(failed = errors.len(), total, topic = %self.topic, reason = %first, "batch not acknowledged");
            return Err(PublishError::Unacknowledged {
                failed: errors.len(),
                total,
                first: first.to_string(),
            });
        }
        tracing::debug!(total, topic = %self.topic, "batch acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TickInterval;

    #[test]
    fn record_json_carries_key_and_payload() {
        let interval = TickInterval::new(100, 1, 2);
        let r = Record::json(&interval.kafka_key(), &interval).unwrap();
        assert_eq!(r.key, vec![100, 0, 0, 0]);
        let v: serde_json::Value = serde_json::from_slice(&r.payload).unwrap();
        assert_eq!(v, serde_json::json!({"epoch": 100, "from": 1, "to": 2}));
    }

    #[test]
    fn unacknowledged_error_reports_counts() {
        let e = PublishError::Unacknowledged {
            failed: 2,
            total: 5,
            first: "broker down".into(),
        };
        assert_eq!(
            e.to_string(),
            "2 of 5 records not acknowledged, first error: broker down"
        );
    }
}
