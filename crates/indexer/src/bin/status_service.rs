#[tokio::main]
async fn main() -> anyhow::Result<()> {
    qubic_publisher::app::init_tracing();
    qubic_indexer::app::run_status_service().await
}
