//! Transactions stage: one record per tick (empty ticks included), crawled
//! per epoch with a bounded number of epochs in flight.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{CursorMode, CycleReport, ProducerError, Stage, StageContext, TickBatcher};
use crate::archiver::ArchiverError;
use crate::convert;
use crate::planner::{self, EpochStart, RewindGuard};
use crate::pool::WorkerPool;
use crate::sink::Record;
use crate::store::StoreError;

pub struct TransactionsProducer {
    batcher: TickBatcher,
    epoch_concurrency: usize,
    rewind: RewindGuard,
}

impl TransactionsProducer {
    pub fn new(ctx: StageContext, pool: WorkerPool, batch_size: usize, epoch_concurrency: usize) -> Self {
        Self {
            batcher: TickBatcher {
                ctx,
                pool,
                batch_size: batch_size.max(1),
                mode: CursorMode::PerEpoch,
            },
            epoch_concurrency: epoch_concurrency.max(1),
            rewind: RewindGuard::default(),
        }
    }
}

#[async_trait]
impl Stage for TransactionsProducer {
    fn name(&self) -> &'static str {
        "transactions"
    }

    fn apply_override(&self, epoch: u32, tick: u32) -> Result<(), StoreError> {
        self.batcher.ctx.store.commit_tick(epoch, tick)
    }

    async fn cycle(&mut self) -> Result<CycleReport, ProducerError> {
        let ctx = &self.batcher.ctx;
        let status = ctx.archiver.status().await?;
        planner::validate_status(&status)?;
        self.rewind.check(&status)?;
        ctx.metrics.set_source(status.latest_tick(), status.latest_epoch());

        let cursors = ctx.store.epoch_ticks()?;
        let starts = planner::epoch_starting_ticks(&status, &cursors)?;

        let permits = Arc::new(Semaphore::new(self.epoch_concurrency));
        let mut workers = JoinSet::new();
        for (epoch, start) in starts {
            let EpochStart::From(start) = start else {
                tracing::debug!(epoch, "epoch fully processed");
                continue;
            };
            let ranges = planner::epoch_ranges(&status, epoch, start);
            if ranges.is_empty() {
                continue;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let batcher = self.batcher.clone();
            workers.spawn(async move {
                let _permit = permit;
                let archiver = Arc::clone(&batcher.ctx.archiver);
                let fetch = move |tick: u32| {
                    let archiver = Arc::clone(&archiver);
                    async move {
                        match archiver.tick_transactions(tick).await {
                            Err(ArchiverError::EmptyTick(_)) => Ok(Vec::new()),
                            other => other,
                        }
                    }
                };
                batcher
                    .run(epoch, ranges, fetch, |tick, txs| {
                        let payload = convert::tick_transactions(epoch, tick, &txs)?;
                        payload.validate()?;
                        Ok(Some(Record::json(&payload.kafka_key(), &payload)?))
                    })
                    .await
                    .map_err(|e| (epoch, e))
            });
        }

        let mut report = CycleReport::default();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(r)) => report += r,
                Ok(Err((epoch, e))) => {
                    tracing::warn!(epoch, reason = %e, "epoch worker failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(ProducerError::Join(e.to_string()));
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}
