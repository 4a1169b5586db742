use qubic_publisher::app;
use qubic_publisher::pool::WorkerPool;
use qubic_publisher::{StageDefaults, TransactionsProducer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::init_tracing();
    app::run_publisher(StageDefaults::TRANSACTIONS, |ctx, cfg| {
        let pool = WorkerPool::new(cfg.worker_count, cfg.fetch_policy());
        TransactionsProducer::new(ctx, pool, cfg.batch_size, cfg.epoch_concurrency)
    })
    .await
}
