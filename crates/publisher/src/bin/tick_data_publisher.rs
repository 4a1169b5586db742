use qubic_publisher::app;
use qubic_publisher::pool::WorkerPool;
use qubic_publisher::{StageDefaults, TickDataProducer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::init_tracing();
    app::run_publisher(StageDefaults::TICK_DATA, |ctx, cfg| {
        let pool = WorkerPool::new(cfg.worker_count, cfg.fetch_policy());
        TickDataProducer::new(ctx, pool, cfg.batch_size)
    })
    .await
}
