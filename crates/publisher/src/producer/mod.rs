//! Producer stages: source (archiver) → transform → Kafka sink + durable cursor.
//!
//! - **Transactions**: per-epoch fan-out, each epoch worker crawls its own
//!   intervals in batches and advances its per-epoch cursor.
//! - **Tick data**: single global cursor, one interval-bounded range per cycle.
//! - **Tick intervals** / **Computors**: epoch cursor, one record set per epoch.
//!
//! Every stage runs under [run_stage]: cycle, sleep the stage cadence, repeat
//! until shutdown. A failed cycle leaves the cursor untouched and is retried.

pub mod computors;
pub mod tick_data;
pub mod tick_intervals;
pub mod transactions;

pub use computors::ComputorsProducer;
pub use tick_data::TickDataProducer;
pub use tick_intervals::TickIntervalsProducer;
pub use transactions::TransactionsProducer;

use async_trait::async_trait;
use std::future::Future;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::archiver::{Archiver, ArchiverError};
use crate::convert::ConvertError;
use crate::metrics::Metrics;
use crate::model::ValidationError;
use crate::planner::{self, PlanError, TickRange};
use crate::pool::{FetchOutcome, WorkerLost, WorkerPool};
use crate::sink::{PublishError, Record, RecordSink};
use crate::store::{CursorStore, StoreError};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("archiver: {0}")]
    Archiver(#[from] ArchiverError),
    #[error("plan: {0}")]
    Plan(#[from] PlanError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("publish: {0}")]
    Publish(#[from] PublishError),
    #[error("convert: {0}")]
    Convert(#[from] ConvertError),
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    WorkerLost(#[from] WorkerLost),
    #[error("epoch worker failed: {0}")]
    Join(String),
}

/// Components every producer stage is built from.
#[derive(Clone)]
pub struct StageContext {
    pub archiver: Arc<dyn Archiver>,
    pub sink: Arc<dyn RecordSink>,
    pub store: Arc<CursorStore>,
    pub metrics: Metrics,
    pub shutdown: CancellationToken,
}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub ticks: usize,
    pub records: usize,
}

impl AddAssign for CycleReport {
    fn add_assign(&mut self, rhs: Self) {
        self.ticks += rhs.ticks;
        self.records += rhs.records;
    }
}

#[async_trait]
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    /// Replaces the stored cursor (administrative override).
    fn apply_override(&self, epoch: u32, tick: u32) -> Result<(), StoreError>;

    /// One scheduling cycle: fetch status, plan, execute, commit.
    async fn cycle(&mut self) -> Result<CycleReport, ProducerError>;
}

/// Runs `stage` every `cadence` until `shutdown` fires. A running cycle is
/// allowed to finish; no new cycle starts after shutdown.
pub async fn run_stage<S: Stage>(mut stage: S, cadence: Duration, shutdown: CancellationToken) {
    let name = stage.name();
    tracing::info!(stage = name, ?cadence, "stage started");
    while !shutdown.is_cancelled() {
        match stage.cycle().await {
            Ok(report) if report.ticks > 0 || report.records > 0 => {
                tracing::info!(stage = name, ticks = report.ticks, records = report.records, "cycle done");
            }
            Ok(_) => tracing::debug!(stage = name, "nothing to do"),
            Err(e) => tracing::warn!(stage = name, reason = %e, "cycle failed, retrying"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(cadence) => {}
        }
    }
    tracing::info!(stage = name, "stage stopped");
}

/// Which cursor a tick batch advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorMode {
    /// Only the epoch's own entry (epochs progress concurrently).
    PerEpoch,
    /// The epoch entry and the global last-processed tick.
    Global,
}

/// Shared batch loop of the tick-indexed stages.
#[derive(Clone)]
pub(crate) struct TickBatcher {
    pub ctx: StageContext,
    pub pool: WorkerPool,
    pub batch_size: usize,
    pub mode: CursorMode,
}

impl TickBatcher {
    /// Crawls `ranges` of `epoch` batch by batch. Each batch is fetched in
    /// parallel, published, and only then committed to the cursor. Stops early
    /// (between batches) on shutdown.
    pub async fn run<T, F, Fut, M>(
        &self,
        epoch: u32,
        mut ranges: Vec<TickRange>,
        fetch: F,
        to_record: M,
    ) -> Result<CycleReport, ProducerError>
    where
        T: Send + 'static,
        F: Fn(u32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ArchiverError>> + Send + 'static,
        M: Fn(u32, T) -> Result<Option<Record>, ProducerError>,
    {
        let mut report = CycleReport::default();
        while !self.ctx.shutdown.is_cancelled() {
            let ticks = planner::take_batch(&mut ranges, self.batch_size);
            let (Some(&first), Some(&last)) = (ticks.first(), ticks.last()) else {
                break;
            };
            let outcomes = self.pool.fetch_all(&ticks, fetch.clone()).await?;

            let mut records = Vec::with_capacity(outcomes.len());
            let mut skipped = Vec::new();
            for (tick, outcome) in outcomes {
                match outcome {
                    FetchOutcome::Fetched(payload) => {
                        if let Some(record) = to_record(tick, payload)? {
                            records.push(record);
                        }
                    }
                    FetchOutcome::Skipped { reason } => skipped.push((tick, reason)),
                }
            }

            let published = records.len();
            if !records.is_empty() {
                self.ctx.sink.publish(records).await?;
            }
            for (tick, reason) in &skipped {
                tracing::error!(epoch, tick, %reason, "tick skipped after exhausting retries");
                self.ctx.store.add_skipped_tick(epoch, *tick)?;
            }
            match self.mode {
                CursorMode::PerEpoch => self.ctx.store.set_epoch_tick(epoch, last)?,
                CursorMode::Global => self.ctx.store.commit_tick(epoch, last)?,
            }

            self.ctx.metrics.set_processed(last, epoch);
            self.ctx.metrics.processed_tick_count.inc_by(ticks.len() as u64);
            self.ctx.metrics.processed_message_count.inc_by(published as u64);
            report += CycleReport {
                ticks: ticks.len(),
                records: published,
            };
            tracing::info!(epoch, from = first, to = last, records = published, "batch committed");
        }
        Ok(report)
    }
}
