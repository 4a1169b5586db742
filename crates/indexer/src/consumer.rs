//! Batch consume loop: poll → index → commit.
//!
//! A batch either ends fully indexed with its offsets committed, or fails and
//! stops the loop with nothing committed. Restarting resumes from the last
//! committed offsets.

use prometheus::{IntCounter, Opts, Registry};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use qubic_publisher::metrics::Metrics;

use crate::processor::{BatchSummary, ConsumeError, Processor};
use crate::source::{last_offsets, RecordSource};

#[derive(Clone)]
pub struct ConsumerMetrics {
    pub base: Metrics,
    pub processed_batch_count: IntCounter,
}

impl ConsumerMetrics {
    pub fn new(registry: &Registry, namespace: &str) -> Result<Self, prometheus::Error> {
        let base = Metrics::new(registry, namespace)?;
        let processed_batch_count = IntCounter::with_opts(
            Opts::new("processed_batch_count", "Number of indexed batches").namespace(namespace),
        )?;
        registry.register(Box::new(processed_batch_count.clone()))?;
        Ok(Self {
            base,
            processed_batch_count,
        })
    }

    fn record(&self, summary: &BatchSummary) {
        self.processed_batch_count.inc();
        self.base.processed_message_count.inc_by(summary.documents as u64);
        self.base.processed_tick_count.inc_by(summary.records as u64);
        if let Some((epoch, tick)) = summary.last_tick {
            self.base.set_processed(tick, epoch);
        }
    }
}

pub struct ElasticConsumer<S> {
    source: S,
    processor: Processor,
    metrics: ConsumerMetrics,
    batch_size: usize,
    poll_timeout: Duration,
}

impl<S: RecordSource> ElasticConsumer<S> {
    pub fn new(
        source: S,
        processor: Processor,
        metrics: ConsumerMetrics,
        batch_size: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            source,
            processor,
            metrics,
            batch_size: batch_size.max(1),
            poll_timeout,
        }
    }

    /// Polls, indexes and commits one batch. `Ok(None)` when nothing arrived.
    pub async fn consume_batch(&mut self) -> Result<Option<BatchSummary>, ConsumeError> {
        let records = self.source.poll_batch(self.batch_size, self.poll_timeout).await?;
        if records.is_empty() {
            return Ok(None);
        }
        let summary = self.processor.process(&records).await?;
        self.source.commit(&last_offsets(&records)).await?;
        self.metrics.record(&summary);
        Ok(Some(summary))
    }

    /// Consumes until `shutdown` fires or a batch fails.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ConsumeError> {
        let stream = self.processor.stream();
        tracing::info!(%stream, batch_size = self.batch_size, "consumer started");
        while !shutdown.is_cancelled() {
            match self.consume_batch().await {
                Ok(Some(summary)) => tracing::info!(
                    %stream,
                    records = summary.records,
                    documents = summary.documents,
                    "batch indexed"
                ),
                Ok(None) => tracing::debug!(%stream, "no new records"),
                Err(e) => {
                    tracing::error!(%stream, reason = %e, "batch failed, stopping consumer");
                    return Err(e);
                }
            }
        }
        tracing::info!(%stream, "consumer stopped");
        Ok(())
    }
}
