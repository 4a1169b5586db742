//! Computors stage: one record per epoch, including the current one. An epoch
//! whose list the archiver does not have yet halts the cycle without moving
//! the cursor, so it is asked for again next time.

use async_trait::async_trait;

use super::{CycleReport, ProducerError, Stage, StageContext};
use crate::archiver::ArchiverError;
use crate::convert;
use crate::planner::{self, RewindGuard};
use crate::sink::Record;
use crate::store::{OrZero, StoreError};

pub struct ComputorsProducer {
    ctx: StageContext,
    rewind: RewindGuard,
}

impl ComputorsProducer {
    pub fn new(ctx: StageContext) -> Self {
        Self {
            ctx,
            rewind: RewindGuard::default(),
        }
    }
}

#[async_trait]
impl Stage for ComputorsProducer {
    fn name(&self) -> &'static str {
        "computors"
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
        for epoch in planner::pending_epochs(&status, last_epoch)? {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }
            let mut archived = match self.ctx.archiver.computors(epoch).await {
                Ok(archived) => archived,
                Err(ArchiverError::NotFound(_)) => {
                    tracing::warn!(epoch, "computor list not available yet");
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if archived.epoch == 0 {
                archived.epoch = epoch;
            }
            let first_tick = status
                .epoch_intervals(epoch)
                .first()
                .map(|i| i.from)
                .unwrap_or_default();
            let computors = convert::epoch_computors(&archived, first_tick)?;
            computors.validate()?;

            let record = Record::json(&computors.kafka_key(), &computors)?;
            self.ctx.sink.publish(vec![record]).await?;
            self.ctx.store.set_last_processed_epoch(epoch)?;

            self.ctx.metrics.processed_epoch.set(i64::from(epoch));
            self.ctx.metrics.processed_message_count.inc();
            report.records += 1;
            tracing::info!(epoch, identities = computors.identities.len(), "computors published");
        }
        Ok(report)
    }
}
