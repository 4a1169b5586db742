//! Turns polled Kafka records into Elasticsearch index actions.
//!
//! | stream         | record            | document id        |
//! |----------------|-------------------|--------------------|
//! | transactions   | TickTransactions  | `transaction.hash` |
//! | tick-data      | TickData          | `tickNumber`       |
//! | tick-intervals | TickInterval      | `"{epoch}-{from}"` |
//! | computors      | EpochComputors    | `epoch`            |
//!
//! Tick intervals are merged against what is already stored before indexing:
//! an interval only ever grows, so the stored `to` wins unless the incoming one
//! is larger. A stored or batched interval of the same epoch that overlaps an
//! incoming one but starts at another tick fails the batch.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use qubic_publisher::model::{EpochComputors, TickData, TickInterval, TickTransactions, ValidationError};

use crate::config::Stream;
use crate::elastic::{DocumentStore, ElasticError, IndexAction};
use crate::source::ConsumedRecord;

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("decode error at partition {partition} offset {offset}: {reason}")]
    Decode {
        partition: i32,
        offset: i64,
        reason: String,
    },
    #[error("elasticsearch: {0}")]
    Elastic(#[from] ElasticError),
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

fn decode<T: serde::de::DeserializeOwned>(record: &ConsumedRecord) -> Result<T, ConsumeError> {
    serde_json::from_slice(&record.payload).map_err(|e| ConsumeError::Decode {
        partition: record.partition,
        offset: record.offset,
        reason: e.to_string(),
    })
}

fn overlaps(a: &TickInterval, b: &TickInterval) -> bool {
    a.epoch == b.epoch && a.from <= b.to && b.from <= a.to
}

fn conflict(existing: &TickInterval, interval: &TickInterval, origin: &str) -> ConsumeError {
    ConsumeError::IllegalState(format!(
        "{origin} interval {existing:?} overlaps incoming {interval:?} with a different start"
    ))
}

/// Merges `incoming` intervals with the overlapping `stored` ones and with
/// each other. Returns the intervals that must be (re)indexed, in first-seen
/// order. Two intervals of one epoch that overlap but start at different
/// ticks are an illegal state.
pub fn merge_intervals(
    stored: &[TickInterval],
    incoming: Vec<TickInterval>,
) -> Result<Vec<TickInterval>, ConsumeError> {
    let by_id: HashMap<String, &TickInterval> = stored.iter().map(|i| (i.document_id(), i)).collect();
    let mut accepted: Vec<TickInterval> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();
    for interval in incoming {
        if let Some(existing) = stored
            .iter()
            .find(|s| s.from != interval.from && overlaps(s, &interval))
        {
            return Err(conflict(existing, &interval, "stored"));
        }
        if let Some(existing) = accepted
            .iter()
            .find(|a| a.from != interval.from && overlaps(a, &interval))
        {
            return Err(conflict(existing, &interval, "batched"));
        }
        let key = interval.document_id();
        if let Some(&i) = position.get(&key) {
            if accepted[i].to < interval.to {
                accepted[i] = interval;
            }
            continue;
        }
        if let Some(existing) = by_id.get(&key) {
            if existing.to >= interval.to {
                tracing::debug!(id = %key, stored_to = existing.to, to = interval.to, "interval already covered");
                continue;
            }
        }
        position.insert(key, accepted.len());
        accepted.push(interval);
    }
    Ok(accepted)
}

/// What one processed batch contained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub records: usize,
    pub documents: usize,
    /// Highest `(epoch, tick)` seen, when the stream carries ticks.
    pub last_tick: Option<(u32, u32)>,
}

impl BatchSummary {
    fn observe(&mut self, epoch: u32, tick: u32) {
        if self.last_tick.map_or(true, |(_, t)| tick > t) {
            self.last_tick = Some((epoch, tick));
        }
    }
}

/// Stream-specific transformation plus bulk indexing into one alias.
pub struct Processor {
    stream: Stream,
    index: String,
    elastic: Arc<dyn DocumentStore>,
}

impl Processor {
    pub fn new(stream: Stream, index: impl Into<String>, elastic: Arc<dyn DocumentStore>) -> Self {
        Self {
            stream,
            index: index.into(),
            elastic,
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Indexes `records` or fails the whole batch.
    pub async fn process(&self, records: &[ConsumedRecord]) -> Result<BatchSummary, ConsumeError> {
        let mut summary = BatchSummary {
            records: records.len(),
            ..BatchSummary::default()
        };
        let actions = match self.stream {
            Stream::Transactions => transaction_actions(records, &mut summary)?,
            Stream::TickData => tick_data_actions(records, &mut summary)?,
            Stream::Computors => computors_actions(records)?,
            Stream::TickIntervals => self.interval_actions(records, &mut summary).await?,
        };
        summary.documents = actions.len();
        self.elastic.bulk_index(&self.index, actions).await?;
        Ok(summary)
    }

    async fn interval_actions(
        &self,
        records: &[ConsumedRecord],
        summary: &mut BatchSummary,
    ) -> Result<Vec<IndexAction>, ConsumeError> {
        let incoming = records
            .iter()
            .map(|r| -> Result<TickInterval, ConsumeError> {
                let interval: TickInterval = decode(r)?;
                interval.validate()?;
                Ok(interval)
            })
            .collect::<Result<Vec<_>, ConsumeError>>()?;
        let stored = self.elastic.overlapping_intervals(&self.index, &incoming).await?;
        let merged = merge_intervals(&stored, incoming)?;
        merged
            .iter()
            .map(|interval| -> Result<IndexAction, ConsumeError> {
                summary.observe(interval.epoch, interval.to);
                IndexAction::new(interval.document_id(), interval).map_err(encode_error)
            })
            .collect()
    }
}

fn encode_error(e: serde_json::Error) -> ConsumeError {
    ConsumeError::Elastic(ElasticError::Decode(e.to_string()))
}

fn transaction_actions(
    records: &[ConsumedRecord],
    summary: &mut BatchSummary,
) -> Result<Vec<IndexAction>, ConsumeError> {
    let mut actions = Vec::new();
    for record in records {
        let tick: TickTransactions = decode(record)?;
        tick.validate()?;
        summary.observe(tick.epoch, tick.tick_number);
        for tx in &tick.transactions {
            actions.push(IndexAction::new(tx.hash.clone(), tx).map_err(encode_error)?);
        }
    }
    Ok(actions)
}

fn tick_data_actions(
    records: &[ConsumedRecord],
    summary: &mut BatchSummary,
) -> Result<Vec<IndexAction>, ConsumeError> {
    records
        .iter()
        .map(|record| -> Result<IndexAction, ConsumeError> {
            let data: TickData = decode(record)?;
            data.validate()?;
            summary.observe(data.epoch, data.tick_number);
            IndexAction::new(data.document_id(), &data).map_err(encode_error)
        })
        .collect()
}

fn computors_actions(records: &[ConsumedRecord]) -> Result<Vec<IndexAction>, ConsumeError> {
    records
        .iter()
        .map(|record| -> Result<IndexAction, ConsumeError> {
            let computors: EpochComputors = decode(record)?;
            computors.validate()?;
            IndexAction::new(computors.document_id(), &computors).map_err(encode_error)
        })
        .collect()
}
