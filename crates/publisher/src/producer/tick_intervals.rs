//! Tick-intervals stage: publishes the intervals of every finalized epoch
//! (strictly before the archiver's current one) exactly once per epoch cursor.

use async_trait::async_trait;

use super::{CycleReport, ProducerError, Stage, StageContext};
use crate::planner::{self, RewindGuard};
use crate::sink::Record;
use crate::store::{OrZero, StoreError};

pub struct TickIntervalsProducer {
    ctx: StageContext,
    rewind: RewindGuard,
}

impl TickIntervalsProducer {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            rewind: RewindGuard::default(),
        }
    }
}

#[async_trait]
impl Stage for TickIntervalsProducer {
    fn name(&self) -> &'static str {
        "tick-intervals"
    }

    fn apply_override(&self, epoch: u32, _tick: u32) -> Result<(), StoreError> {
        self.ctx.store.set_last_processed_epoch(epoch)
    }

    async fn cycle(&mut self) -> Result<CycleReport, ProducerError> {
        let status = self.ctx.archiver.status().await?;
        planner::validate_status(&status)?;
        self.rewind.check(&status)?;
        self.ctx.metrics.set_source(status.latest_tick(), status.latest_epoch());

        let last_epoch = self.ctx.store.last_processed_epoch().or_zero()?;
        let mut report = CycleReport::default();
        for epoch in planner::finalized_epochs(&status, last_epoch)? {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }
            let intervals = status.epoch_intervals(epoch);
            let records = intervals
                .iter()
                .map(|interval| -> Result<Record, ProducerError> {
                    interval.validate()?;
                    Ok(Record::json(&interval.kafka_key(), interval)?)
                })
                .collect::<Result<Vec<_>, ProducerError>>()?;

            let published = records.len();
            if !records.is_empty() {
                self.ctx.sink.publish(records).await?;
            }
            self.ctx.store.set_last_processed_epoch(epoch)?;

            if let Some(last) = intervals.last() {
                self.ctx.metrics.set_processed(last.to, epoch);
            }
            self.ctx.metrics.processed_message_count.inc_by(published as u64);
            report.records += published;
            tracing::info!(epoch, intervals = published, "epoch intervals published");
        }
        Ok(report)
    }
}
