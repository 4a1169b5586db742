//! Verification sync: advances the status service's own cursor once the
//! transactions Elasticsearch holds for each tick match the archiver's count.
//!
//! Only ticks up to the highest indexed tick are verified. That horizon comes
//! from whichever partition is furthest ahead, so a tick with fewer documents
//! than archived transactions may still be in flight on a slower partition:
//! the cursor stops before it and the tick is retried on the next cycle. Only
//! after it has held the cursor back for the lag budget is it recorded as an
//! erroneous skipped tick. A tick with more documents than transactions is
//! recorded right away.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use qubic_publisher::archiver::{Archiver, ArchiverError};
use qubic_publisher::metrics::Metrics;
use qubic_publisher::planner::{self, PlanError, RewindGuard, TickRange};
use qubic_publisher::pool::{FetchOutcome, WorkerLost, WorkerPool};
use qubic_publisher::store::{CursorStore, OrZero, StoreError};

use crate::elastic::{DocumentStore, ElasticError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("archiver: {0}")]
    Archiver(#[from] ArchiverError),
    #[error("elasticsearch: {0}")]
    Elastic(#[from] ElasticError),
    #[error("plan: {0}")]
    Plan(#[from] PlanError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    WorkerLost(#[from] WorkerLost),
}

/// Transaction counts for one tick on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickCounts {
    pub archived: u64,
    pub indexed: u64,
}

async fn tick_counts(
    archiver: &dyn Archiver,
    elastic: &dyn DocumentStore,
    index: &str,
    tick: u32,
) -> Result<TickCounts, SyncError> {
    let archived = match archiver.tick_transactions(tick).await {
        Ok(txs) => txs.len() as u64,
        Err(ArchiverError::EmptyTick(_)) => 0,
        Err(e) => return Err(e.into()),
    };
    let indexed = elastic.count_tick_transactions(index, tick).await?;
    Ok(TickCounts { archived, indexed })
}

/// How a tick's counts still differ after every verification round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    /// Fewer documents than archived transactions, or the counts could not
    /// be fetched.
    Missing,
    /// More documents than archived transactions.
    Excess,
}

impl Mismatch {
    fn of(counts: TickCounts) -> Option<Self> {
        match counts.indexed.cmp(&counts.archived) {
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Less => Some(Mismatch::Missing),
            std::cmp::Ordering::Greater => Some(Mismatch::Excess),
        }
    }
}

/// A missing tick holding the cursor back, and for how many cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    pub tick: u32,
    pub cycles: u32,
}

/// Outcome of one verified batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Settled {
    /// Highest tick the cursor may move to.
    pub last: Option<u32>,
    /// Ticks to record as skipped.
    pub flagged: Vec<u32>,
    /// Ticks the cursor advances over.
    pub advanced: usize,
}

/// Walks `ticks` in order and decides how far the cursor moves. A missing
/// tick stops the walk until it has been deferred for more than `budget`
/// cycles.
pub fn settle(
    ticks: &[u32],
    mismatches: &BTreeMap<u32, Mismatch>,
    deferred: &mut Option<Deferral>,
    budget: u32,
) -> Settled {
    let mut settled = Settled::default();
    for &tick in ticks {
        match mismatches.get(&tick) {
            None => {}
            Some(Mismatch::Excess) => settled.flagged.push(tick),
            Some(Mismatch::Missing) => {
                let cycles = match *deferred {
                    Some(d) if d.tick == tick => d.cycles.saturating_add(1),
                    _ => 1,
                };
                if cycles <= budget {
                    *deferred = Some(Deferral { tick, cycles });
                    break;
                }
                *deferred = None;
                settled.flagged.push(tick);
            }
        }
        settled.last = Some(tick);
        settled.advanced += 1;
    }
    if matches!((*deferred, settled.last), (Some(d), Some(last)) if d.tick <= last) {
        *deferred = None;
    }
    settled
}

/// Delay after `errors` consecutive failed cycles.
pub fn error_backoff(errors: u32) -> Duration {
    Duration::from_millis(100)
        .saturating_mul(errors)
        .min(Duration::from_secs(10))
}

pub struct VerificationSync {
    archiver: Arc<dyn Archiver>,
    elastic: Arc<dyn DocumentStore>,
    transactions_index: Arc<str>,
    store: Arc<CursorStore>,
    pool: WorkerPool,
    batch_size: usize,
    verify_attempts: u32,
    retry_delay: Duration,
    lag_budget: u32,
    deferred: Option<Deferral>,
    metrics: Metrics,
    rewind: RewindGuard,
}

impl VerificationSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        archiver: Arc<dyn Archiver>,
        elastic: Arc<dyn DocumentStore>,
        transactions_index: &str,
        store: Arc<CursorStore>,
        pool: WorkerPool,
        batch_size: usize,
        verify_attempts: u32,
        metrics: Metrics,
    ) -> Self {
        Self {
            archiver,
            elastic,
            transactions_index: Arc::from(transactions_index),
            store,
            pool,
            batch_size: batch_size.max(1),
            verify_attempts: verify_attempts.max(1),
            retry_delay: Duration::from_millis(500),
            lag_budget: 60,
            deferred: None,
            metrics,
            rewind: RewindGuard::default(),
        }
    }

    /// Delay between verification rounds of one batch.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Cycles a missing tick may hold the cursor back before it is recorded
    /// as skipped. Zero records it on the first cycle.
    pub fn with_lag_budget(mut self, cycles: u32) -> Self {
        self.lag_budget = cycles;
        self
    }

    /// Verifies and commits at most one batch; returns the number of ticks
    /// the cursor advanced by.
    pub async fn cycle(&mut self) -> Result<usize, SyncError> {
        let status = self.archiver.status().await?;
        planner::validate_status(&status)?;
        self.rewind.check(&status)?;
        self.metrics.set_source(status.latest_tick(), status.latest_epoch());

        let cursor = self.store.last_processed_tick().or_zero()?;
        let Some(range) = planner::next_tick_range(&status, cursor) else {
            return Ok(0);
        };
        let Some(horizon) = self.elastic.last_indexed_tick(&self.transactions_index).await? else {
            return Ok(0);
        };
        if horizon < range.start {
            return Ok(0);
        }
        let mut ranges = vec![TickRange {
            end: range.end.min(horizon),
            ..range
        }];
        let ticks = planner::take_batch(&mut ranges, self.batch_size);
        if ticks.is_empty() {
            return Ok(0);
        }

        let mismatches = self.verify(&ticks).await?;
        let settled = settle(&ticks, &mismatches, &mut self.deferred, self.lag_budget);
        if let Some(d) = self.deferred {
            tracing::info!(epoch = range.epoch, tick = d.tick, cycles = d.cycles, "waiting for a lagging tick");
        }
        let Some(last) = settled.last else {
            return Ok(0);
        };
        for &tick in &settled.flagged {
            tracing::error!(epoch = range.epoch, tick, "transaction count mismatch, recording skipped tick");
            self.store.add_skipped_tick(range.epoch, tick)?;
        }
        self.store.commit_tick(range.epoch, last)?;
        self.store.set_last_processed_epoch(range.epoch)?;

        self.metrics.set_processed(last, range.epoch);
        self.metrics.processed_tick_count.inc_by(settled.advanced as u64);
        tracing::debug!(
            epoch = range.epoch,
            from = ticks[0],
            to = last,
            erroneous = settled.flagged.len(),
            "ticks verified"
        );
        Ok(settled.advanced)
    }

    /// Ticks whose counts still differ after every round.
    async fn verify(&self, ticks: &[u32]) -> Result<BTreeMap<u32, Mismatch>, SyncError> {
        let mut pending = ticks.to_vec();
        let mut mismatches = BTreeMap::new();
        for round in 1..=self.verify_attempts {
            let archiver = Arc::clone(&self.archiver);
            let elastic = Arc::clone(&self.elastic);
            let index = Arc::clone(&self.transactions_index);
            let check = move |tick: u32| {
                let (archiver, elastic, index) = (Arc::clone(&archiver), Arc::clone(&elastic), Arc::clone(&index));
                async move { tick_counts(archiver.as_ref(), elastic.as_ref(), &index, tick).await }
            };
            let outcomes = self.pool.fetch_all(&pending, check).await?;
            mismatches.clear();
            for (tick, outcome) in outcomes {
                let mismatch = match outcome {
                    FetchOutcome::Fetched(c) => {
                        let mismatch = Mismatch::of(c);
                        if mismatch.is_some() {
                            tracing::debug!(tick, round, archived = c.archived, indexed = c.indexed, "count mismatch");
                        }
                        mismatch
                    }
                    FetchOutcome::Skipped { reason } => {
                        tracing::warn!(tick, round, %reason, "verification failed");
                        Some(Mismatch::Missing)
                    }
                };
                if let Some(mismatch) = mismatch {
                    mismatches.insert(tick, mismatch);
                }
            }
            pending = mismatches.keys().copied().collect();
            if pending.is_empty() {
                break;
            }
            if round < self.verify_attempts {
                sleep(self.retry_delay).await;
            }
        }
        Ok(mismatches)
    }
}

/// Runs the sync until shutdown. Busy while there is work, `idle` between
/// empty cycles, [error_backoff] after failures.
pub async fn run_sync(mut sync: VerificationSync, idle: Duration, shutdown: CancellationToken) {
    let mut errors = 0u32;
    while !shutdown.is_cancelled() {
        let delay = match sync.cycle().await {
            Ok(0) => {
                errors = 0;
                idle
            }
            Ok(_) => {
                errors = 0;
                Duration::ZERO
            }
            Err(e) => {
                errors = errors.saturating_add(1);
                tracing::warn!(errors, reason = %e, "sync cycle failed");
                error_backoff(errors)
            }
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
    tracing::info!("verification sync stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_backoff_grows_then_caps() {
        assert_eq!(error_backoff(1), Duration::from_millis(100));
        assert_eq!(error_backoff(7), Duration::from_millis(700));
        assert_eq!(error_backoff(100), Duration::from_secs(10));
        assert_eq!(error_backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn missing_tick_holds_the_cursor_before_it() {
        let mismatches = BTreeMap::from([(12, Mismatch::Missing)]);
        let mut deferred = None;

        let settled = settle(&[10, 11, 12, 13], &mismatches, &mut deferred, 2);

        assert_eq!(settled.last, Some(11));
        assert_eq!(settled.advanced, 2);
        assert!(settled.flagged.is_empty());
        assert_eq!(deferred, Some(Deferral { tick: 12, cycles: 1 }));
    }

    #[test]
    fn missing_tick_is_flagged_once_the_budget_is_spent() {
        let mismatches = BTreeMap::from([(12, Mismatch::Missing)]);
        let mut deferred = None;

        assert_eq!(settle(&[12, 13], &mismatches, &mut deferred, 2).last, None);
        assert_eq!(settle(&[12, 13], &mismatches, &mut deferred, 2).last, None);
        let settled = settle(&[12, 13], &mismatches, &mut deferred, 2);

        assert_eq!(settled.last, Some(13));
        assert_eq!(settled.flagged, vec![12]);
        assert_eq!(deferred, None);
    }

    #[test]
    fn excess_tick_is_flagged_immediately() {
        let mismatches = BTreeMap::from([(11, Mismatch::Excess)]);
        let mut deferred = None;

        let settled = settle(&[10, 11, 12], &mismatches, &mut deferred, 60);

        assert_eq!(settled.last, Some(12));
        assert_eq!(settled.flagged, vec![11]);
        assert_eq!(deferred, None);
    }

    #[test]
    fn zero_budget_flags_missing_ticks_right_away() {
        let mismatches = BTreeMap::from([(10, Mismatch::Missing)]);
        let settled = settle(&[10, 11], &mismatches, &mut None, 0);
        assert_eq!(settled.flagged, vec![10]);
        assert_eq!(settled.last, Some(11));
    }

    #[test]
    fn counts_classify_by_direction() {
        let c = |archived, indexed| TickCounts { archived, indexed };
        assert_eq!(Mismatch::of(c(2, 2)), None);
        assert_eq!(Mismatch::of(c(3, 1)), Some(Mismatch::Missing));
        assert_eq!(Mismatch::of(c(1, 2)), Some(Mismatch::Excess));
    }
}
