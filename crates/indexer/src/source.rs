//! Kafka record source with manual offset management.
//!
//! Autocommit is off. The consumer loop polls a batch, indexes it, and only
//! then commits `offset + 1` per partition, so a crash or a failed batch
//! replays from the last fully indexed position.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// One polled record, detached from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Highest offset per partition in `records`.
pub fn last_offsets(records: &[ConsumedRecord]) -> BTreeMap<i32, i64> {
    let mut offsets = BTreeMap::new();
    for r in records {
        offsets
            .entry(r.partition)
            .and_modify(|o: &mut i64| *o = (*o).max(r.offset))
            .or_insert(r.offset);
    }
    offsets
}

/// Commit positions for `offsets`: the next offset to read, per partition.
pub fn commit_list(topic: &str, offsets: &BTreeMap<i32, i64>) -> Result<TopicPartitionList, KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for (&partition, &offset) in offsets {
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
    }
    Ok(tpl)
}

#[async_trait]
pub trait RecordSource: Send {
    /// Up to `max` records, waiting at most `wait` for the batch to fill.
    async fn poll_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<ConsumedRecord>, KafkaError>;

    /// Marks everything up to and including `offsets` as consumed.
    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), KafkaError>;
}

pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl KafkaSource {
    pub fn new(brokers: &str, group: &str, topic: impl Into<String>) -> Result<Self, KafkaError> {
        let topic = topic.into();
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("partition.assignment.strategy", "cooperative-sticky")
            .create()?;
        consumer.subscribe(&[topic.as_str()])?;
        tracing::info!(%topic, group, "subscribed");
        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
        })
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn poll_batch(&mut self, max: usize, wait: Duration) -> Result<Vec<ConsumedRecord>, KafkaError> {
        let deadline = Instant::now() + wait;
        let mut batch = Vec::with_capacity(max.min(1024));
        while batch.len() < max {
            let msg = match timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(msg) => msg?,
            };
            batch.push(ConsumedRecord {
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            });
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), KafkaError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let tpl = commit_list(&self.topic, offsets)?;
        let consumer = Arc::clone(&self.consumer);
        match tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await {
            Ok(committed) => committed,
            Err(e) => {
                tracing::error!(reason = %e, "offset commit task failed");
                Err(KafkaError::Canceled)
            }
        }
    }
}
