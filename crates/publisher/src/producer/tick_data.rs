//! Tick-data stage: single global cursor. Empty ticks and ticks still carrying
//! the uninitialized epoch produce no record but still advance the cursor.

use async_trait::async_trait;
use std::sync::Arc;

use super::{CursorMode, CycleReport, ProducerError, Stage, StageContext, TickBatcher};
use crate::archiver::ArchiverError;
use crate::convert;
use crate::planner::{self, RewindGuard};
use crate::pool::WorkerPool;
use crate::sink::Record;
use crate::store::{OrZero, StoreError};

pub struct TickDataProducer {
    batcher: TickBatcher,
    rewind: RewindGuard,
}

impl TickDataProducer {
    pub fn new(ctx: StageContext, pool: WorkerPool, batch_size: usize) -> Self {
        Self {
            batcher: TickBatcher {
                ctx,
                pool,
                batch_size: batch_size.max(1),
                mode: CursorMode::Global,
            },
            rewind: RewindGuard::default(),
        }
    }
}

#[async_trait]
impl Stage for TickDataProducer {
    fn name(&self) -> &'static str {
        "tick-data"
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

        let cursor = ctx.store.last_processed_tick().or_zero()?;
        let Some(range) = planner::next_tick_range(&status, cursor) else {
            return Ok(CycleReport::default());
        };
        tracing::debug!(epoch = range.epoch, start = range.start, end = range.end, "planned tick range");

        let archiver = Arc::clone(&ctx.archiver);
        let fetch = move |tick: u32| {
            let archiver = Arc::clone(&archiver);
            async move {
                match archiver.tick_data(tick).await {
                    Ok(data) => Ok(Some(data)),
                    Err(ArchiverError::EmptyTick(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        };
        self.batcher
            .run(range.epoch, vec![range], fetch, |tick, archived| {
                let Some(archived) = archived else {
                    tracing::debug!(tick, "empty tick");
                    return Ok(None);
                };
                let data = convert::tick_data(&archived)?;
                if let Err(reason) = data.validate() {
                    tracing::debug!(tick, %reason, "tick data not published");
                    return Ok(None);
                }
                Ok(Some(Record::json(&data.kafka_key(), &data)?))
            })
            .await
    }
}
