//! Common helpers for indexer integration tests: an in-memory document store,
//! a scripted record source and a minimal archiver.
#![allow(dead_code)]

use async_trait::async_trait;
use qubic_indexer::elastic::{DocumentStore, ElasticError, IndexAction};
use qubic_indexer::source::{ConsumedRecord, RecordSource};
use qubic_publisher::archiver::{
    ArchivedComputors, ArchivedTickData, ArchivedTransaction, Archiver, ArchiverError, ArchiverStatus,
    EpochIntervals, ProcessedInterval, TickInfo,
};
use qubic_publisher::model::{TickInterval, TickTransactions, Tx};
use rdkafka::error::KafkaError;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn tx(tick: u32, n: u32) -> Tx {
    Tx {
        hash: format!("hash-{tick}-{n}"),
        source: "SRC".into(),
        destination: "DST".into(),
        amount: 10,
        tick_number: tick,
        input_type: 0,
        input_size: 0,
        input_data: String::new(),
        signature: "AP8=".into(),
        timestamp: 1_700_000_000_000,
        money_flew: false,
    }
}

pub fn record<T: Serialize>(partition: i32, offset: i64, value: &T) -> ConsumedRecord {
    ConsumedRecord {
        partition,
        offset,
        key: None,
        payload: serde_json::to_vec(value).unwrap(),
    }
}

pub fn tick_record(partition: i32, offset: i64, epoch: u32, tick: u32, txs: u32) -> ConsumedRecord {
    let tick_txs = TickTransactions {
        epoch,
        tick_number: tick,
        transactions: (0..txs).map(|n| tx(tick, n)).collect(),
    };
    record(partition, offset, &tick_txs)
}

pub fn interval_record(offset: i64, epoch: u32, from: u32, to: u32) -> ConsumedRecord {
    record(0, offset, &TickInterval::new(epoch, from, to))
}

/// Documents per index, upserted by id. `fail` rejects every bulk request.
#[derive(Default)]
pub struct InMemoryElastic {
    pub indices: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    pub fail: AtomicBool,
    pub bulk_calls: AtomicUsize,
}

impl InMemoryElastic {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        self.indices.lock().unwrap().get(index).cloned().unwrap_or_default()
    }

    pub fn put<T: Serialize>(&self, index: &str, id: &str, document: &T) {
        self.indices
            .lock()
            .unwrap()
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), serde_json::to_value(document).unwrap());
    }

    fn ticks(&self, index: &str) -> Vec<u64> {
        self.documents(index)
            .values()
            .filter_map(|d| d.get("tickNumber").and_then(Value::as_u64))
            .collect()
    }

    fn intervals(&self, index: &str) -> Vec<TickInterval> {
        self.documents(index)
            .values()
            .map(|d| serde_json::from_value(d.clone()).unwrap())
            .collect()
    }
}

#[async_trait]
impl DocumentStore for InMemoryElastic {
    async fn bulk_index(&self, index: &str, actions: Vec<IndexAction>) -> Result<(), ElasticError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ElasticError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        let mut indices = self.indices.lock().unwrap();
        let docs = indices.entry(index.to_string()).or_default();
        for action in actions {
            docs.insert(action.id, action.document);
        }
        Ok(())
    }

    async fn overlapping_intervals(
        &self,
        index: &str,
        intervals: &[TickInterval],
    ) -> Result<Vec<TickInterval>, ElasticError> {
        let mut out: Vec<TickInterval> = self
            .intervals(index)
            .into_iter()
            .filter(|s| {
                intervals
                    .iter()
                    .any(|i| s.epoch == i.epoch && s.from <= i.to && s.to >= i.from)
            })
            .collect();
        out.sort_by_key(|i| (i.epoch, i.from));
        Ok(out)
    }

    async fn intervals_before_epoch(&self, index: &str, epoch: u32) -> Result<Vec<TickInterval>, ElasticError> {
        let mut out: Vec<TickInterval> = self.intervals(index).into_iter().filter(|i| i.epoch < epoch).collect();
        out.sort_by_key(|i| (i.epoch, i.from));
        Ok(out)
    }

    async fn count_tick_transactions(&self, index: &str, tick: u32) -> Result<u64, ElasticError> {
        Ok(self.ticks(index).into_iter().filter(|&t| t == u64::from(tick)).count() as u64)
    }

    async fn last_indexed_tick(&self, index: &str) -> Result<Option<u32>, ElasticError> {
        Ok(self.ticks(index).into_iter().max().map(|t| t as u32))
    }
}

/// Hands out queued batches in order and records every commit.
#[derive(Default)]
pub struct ScriptedSource {
    pub batches: VecDeque<Vec<ConsumedRecord>>,
    pub commits: Arc<Mutex<Vec<BTreeMap<i32, i64>>>>,
}

impl ScriptedSource {
    pub fn new(batches: Vec<Vec<ConsumedRecord>>) -> Self {
        Self {
            batches: batches.into(),
            commits: Arc::default(),
        }
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn poll_batch(&mut self, max: usize, _wait: Duration) -> Result<Vec<ConsumedRecord>, KafkaError> {
        let mut batch = self.batches.pop_front().unwrap_or_default();
        batch.truncate(max);
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<(), KafkaError> {
        self.commits.lock().unwrap().push(offsets.clone());
        Ok(())
    }
}

pub fn status(latest_tick: u32, latest_epoch: u32, intervals: &[(u32, u32, u32)]) -> ArchiverStatus {
    let mut per_epoch: BTreeMap<u32, Vec<ProcessedInterval>> = BTreeMap::new();
    for &(epoch, from, to) in intervals {
        per_epoch.entry(epoch).or_default().push(ProcessedInterval {
            initial_processed_tick: from,
            last_processed_tick: to,
        });
    }
    ArchiverStatus {
        last_processed_tick: TickInfo {
            tick_number: latest_tick,
            epoch: latest_epoch,
        },
        processed_tick_intervals_per_epoch: per_epoch
            .into_iter()
            .map(|(epoch, intervals)| EpochIntervals { epoch, intervals })
            .collect(),
    }
}

/// Archiver that only knows its status and per-tick transaction counts.
/// Ticks without a count are empty.
#[derive(Default)]
pub struct CountingArchiver {
    pub status: Mutex<ArchiverStatus>,
    pub counts: Mutex<HashMap<u32, u32>>,
}

impl CountingArchiver {
    pub fn new(status: ArchiverStatus) -> Self {
        Self {
            status: Mutex::new(status),
            ..Self::default()
        }
    }

    pub fn set_status(&self, status: ArchiverStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn set_count(&self, tick: u32, count: u32) {
        self.counts.lock().unwrap().insert(tick, count);
    }
}

#[async_trait]
impl Archiver for CountingArchiver {
    async fn status(&self) -> Result<ArchiverStatus, ArchiverError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn tick_transactions(&self, tick: u32) -> Result<Vec<ArchivedTransaction>, ArchiverError> {
        match self.counts.lock().unwrap().get(&tick) {
            Some(&n) if n > 0 => Ok(vec![ArchivedTransaction::default(); n as usize]),
            _ => Err(ArchiverError::EmptyTick(tick)),
        }
    }

    async fn tick_data(&self, tick: u32) -> Result<ArchivedTickData, ArchiverError> {
        Err(ArchiverError::EmptyTick(tick))
    }

    async fn computors(&self, epoch: u32) -> Result<ArchivedComputors, ArchiverError> {
        Err(ArchiverError::NotFound(format!("computors of epoch {epoch}")))
    }
}
