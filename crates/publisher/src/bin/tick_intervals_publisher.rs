use qubic_publisher::app;
use qubic_publisher::{StageDefaults, TickIntervalsProducer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::init_tracing();
    app::run_publisher(StageDefaults::TICK_INTERVALS, |ctx, _| TickIntervalsProducer::new(ctx)).await
}
