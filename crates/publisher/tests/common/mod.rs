//! Common helpers for producer integration tests: an in-memory archiver and a
//! recording Kafka sink with failure injection.
#![allow(dead_code)]

use async_trait::async_trait;
use prometheus::Registry;
use qubic_publisher::archiver::{
    ArchivedComputors, ArchivedTickData, ArchivedTransaction, ArchivedTransactionBody, Archiver,
    ArchiverError, ArchiverStatus, EpochIntervals, ProcessedInterval, TickInfo,
};
use qubic_publisher::metrics::Metrics;
use qubic_publisher::producer::StageContext;
use qubic_publisher::sink::{PublishError, Record, RecordSink};
use qubic_publisher::store::CursorStore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Status with the latest tick in `latest_epoch` and `(epoch, from, to)` intervals.
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

/// One archived transaction with hex fields the converter accepts.
pub fn archived_tx(tick: u32, n: u32) -> ArchivedTransaction {
    ArchivedTransaction {
        transaction: ArchivedTransactionBody {
            source_id: "SRC".into(),
            dest_id: "DST".into(),
            amount: 100,
            tick_number: tick,
            input_type: 0,
            input_size: 2,
            input_hex: "beef".into(),
            signature_hex: "00ff".into(),
            tx_id: format!("tx-{tick}-{n}"),
        },
        timestamp: 1_700_000_000_000,
        money_flew: true,
    }
}

pub fn archived_tick_data(epoch: u32, tick: u32) -> ArchivedTickData {
    ArchivedTickData {
        computor_index: 7,
        epoch,
        tick_number: tick,
        timestamp: 1_700_000_000_000,
        transaction_ids: vec![format!("tx-{tick}-0")],
        signature_hex: "abcd".into(),
        ..ArchivedTickData::default()
    }
}

/// In-memory archiver. Ticks without an entry are empty; ticks listed in
/// `failing` always error.
#[derive(Default)]
pub struct FakeArchiver {
    pub status: Mutex<ArchiverStatus>,
    pub transactions: Mutex<HashMap<u32, Vec<ArchivedTransaction>>>,
    pub tick_data: Mutex<HashMap<u32, ArchivedTickData>>,
    pub computors: Mutex<HashMap<u32, ArchivedComputors>>,
    pub failing: Mutex<HashSet<u32>>,
    pub calls: AtomicUsize,
}

impl FakeArchiver {
    pub fn new(status: ArchiverStatus) -> Self {
        Self {
            status: Mutex::new(status),
            ..Self::default()
        }
    }

    pub fn set_status(&self, status: ArchiverStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn add_transactions(&self, tick: u32, count: u32) {
        let txs = (0..count).map(|n| archived_tx(tick, n)).collect();
        self.transactions.lock().unwrap().insert(tick, txs);
    }

    pub fn add_tick_data(&self, data: ArchivedTickData) {
        self.tick_data.lock().unwrap().insert(data.tick_number, data);
    }

    pub fn add_computors(&self, epoch: u32, tick: u32) {
        self.computors.lock().unwrap().insert(
            epoch,
            ArchivedComputors {
                epoch,
                tick_number: tick,
                identities: vec!["ID-A".into(), "ID-B".into()],
                signature_hex: "0102".into(),
            },
        );
    }

    pub fn fail_tick(&self, tick: u32) {
        self.failing.lock().unwrap().insert(tick);
    }

    fn check_failing(&self, tick: u32) -> Result<(), ArchiverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&tick) {
            return Err(ArchiverError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn status(&self) -> Result<ArchiverStatus, ArchiverError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn tick_transactions(&self, tick: u32) -> Result<Vec<ArchivedTransaction>, ArchiverError> {
        self.check_failing(tick)?;
        self.transactions
            .lock()
            .unwrap()
            .get(&tick)
            .cloned()
            .ok_or(ArchiverError::EmptyTick(tick))
    }

    async fn tick_data(&self, tick: u32) -> Result<ArchivedTickData, ArchiverError> {
        self.check_failing(tick)?;
        self.tick_data
            .lock()
            .unwrap()
            .get(&tick)
            .cloned()
            .ok_or(ArchiverError::EmptyTick(tick))
    }

    async fn computors(&self, epoch: u32) -> Result<ArchivedComputors, ArchiverError> {
        self.computors
            .lock()
            .unwrap()
            .get(&epoch)
            .cloned()
            .ok_or_else(|| ArchiverError::NotFound(format!("computors of epoch {epoch}")))
    }
}

/// Sink that keeps every acknowledged record; `fail` rejects whole batches.
#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<Record>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<serde_json::Value> {
        self.records()
            .iter()
            .map(|r| serde_json::from_slice(&r.payload).unwrap())
            .collect()
    }

    /// Record keys decoded as little-endian u32.
    pub fn keys(&self) -> Vec<u32> {
        self.records()
            .iter()
            .map(|r| u32::from_le_bytes(r.key.as_slice().try_into().unwrap()))
            .collect()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn publish(&self, records: Vec<Record>) -> Result<(), PublishError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Unacknowledged {
                failed: records.len(),
                total: records.len(),
                first: "broker unavailable".into(),
            });
        }
        self.records.lock().unwrap().extend(records);
        Ok(())
    }
}

pub struct Harness {
    pub archiver: Arc<FakeArchiver>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<CursorStore>,
    pub ctx: StageContext,
}

pub fn harness(dir: &Path, status: ArchiverStatus) -> Harness {
    let archiver = Arc::new(FakeArchiver::new(status));
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(CursorStore::open(dir).unwrap());
    let ctx = StageContext {
        archiver: archiver.clone(),
        sink: sink.clone(),
        store: Arc::clone(&store),
        metrics: Metrics::new(&Registry::new(), "test").unwrap(),
        shutdown: CancellationToken::new(),
    };
    Harness {
        archiver,
        sink,
        store,
        ctx,
    }
}
