use qubic_publisher::app;
use qubic_publisher::{ComputorsProducer, StageDefaults};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::init_tracing();
    app::run_publisher(StageDefaults::COMPUTORS, |ctx, _| ComputorsProducer::new(ctx)).await
}
