//! Process bootstrap for the consumer and status-service binaries.

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Registry;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use qubic_publisher::app::shutdown_on_signal;
use qubic_publisher::archiver::HttpArchiver;
use qubic_publisher::metrics::{self, Metrics};
use qubic_publisher::pool::WorkerPool;
use qubic_publisher::server;
use qubic_publisher::store::CursorStore;

use crate::config::{ConsumerConfig, StatusConfig};
use crate::consumer::{ConsumerMetrics, ElasticConsumer};
use crate::elastic::HttpElastic;
use crate::processor::Processor;
use crate::source::KafkaSource;
use crate::status::{self, StatusService, StatusState, VerificationSync};

const SYNC_IDLE: Duration = Duration::from_secs(1);

/// Consumer HTTP surface: `/health` and `/metrics`.
pub fn consumer_router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(json!({"status": "UP"})) }))
        .route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move { metrics::encode(&registry) }
            }),
        )
}

/// Runs one Kafka → Elasticsearch consumer until shutdown. A failed batch
/// ends the process with an error; the next start resumes from the last
/// committed offsets.
pub async fn run_consumer() -> anyhow::Result<()> {
    let cfg = ConsumerConfig::load().context("loading configuration")?;
    tracing::info!(
        stream = %cfg.stream,
        topic = %cfg.kafka_topic,
        index = %cfg.elastic_index,
        "starting elastic consumer"
    );

    let registry = Registry::new();
    let metrics = ConsumerMetrics::new(&registry, &cfg.metrics_namespace).context("registering metrics")?;
    let elastic = Arc::new(
        HttpElastic::new(
            cfg.elastic_url.clone(),
            cfg.elastic_username.clone(),
            cfg.elastic_password.clone(),
            cfg.elastic_timeout,
            cfg.retry_policy(),
        )
        .context("building Elasticsearch client")?,
    );
    let source = KafkaSource::new(&cfg.kafka_brokers, &cfg.kafka_group, cfg.kafka_topic.clone())
        .context("creating Kafka consumer")?;
    let processor = Processor::new(cfg.stream, cfg.elastic_index.clone(), elastic);
    let consumer = ElasticConsumer::new(source, processor, metrics, cfg.batch_size, cfg.poll_timeout);

    let shutdown = shutdown_on_signal();
    let app = consumer_router(registry);
    let http = tokio::spawn(server::serve(app, cfg.metrics_port, shutdown.clone()));

    let result = consumer.run(shutdown.clone()).await;
    shutdown.cancel();
    match http.await {
        Ok(Err(e)) => tracing::warn!(reason = %e, "metrics server failed"),
        Err(e) => tracing::warn!(reason = %e, "metrics server task failed"),
        Ok(Ok(())) => {}
    }
    result.context("consumer stopped on a failed batch")
}

/// Runs the verification sync and the status HTTP API until shutdown.
pub async fn run_status_service() -> anyhow::Result<()> {
    let cfg = StatusConfig::load().context("loading configuration")?;
    tracing::info!(
        archiver = %cfg.archiver_host,
        elastic = %cfg.elastic_url,
        "starting status service"
    );

    let registry = Registry::new();
    let metrics = Metrics::new(&registry, &cfg.metrics_namespace).context("registering metrics")?;
    let store = Arc::new(
        CursorStore::open(&cfg.store_dir)
            .with_context(|| format!("opening cursor store at {}", cfg.store_dir))?,
    );
    let archiver = Arc::new(
        HttpArchiver::new(cfg.archiver_host.clone(), cfg.archiver_timeout())
            .context("building archiver client")?,
    );
    let elastic = Arc::new(
        HttpElastic::new(
            cfg.elastic_url.clone(),
            cfg.elastic_username.clone(),
            cfg.elastic_password.clone(),
            cfg.elastic_timeout(),
            cfg.retry_policy(),
        )
        .context("building Elasticsearch client")?,
    );

    let sync = VerificationSync::new(
        archiver.clone(),
        elastic.clone(),
        &cfg.elastic_transactions_index,
        Arc::clone(&store),
        WorkerPool::new(cfg.worker_count, cfg.fetch_policy()),
        cfg.batch_size,
        cfg.verify_attempts,
        metrics,
    )
    .with_lag_budget(cfg.lag_cycles);
    let service = Arc::new(StatusService::new(
        archiver,
        elastic,
        cfg.elastic_intervals_index.clone(),
        store,
        cfg.cache_ttl(),
        cfg.status_cache_ttl(),
    ));

    let shutdown = shutdown_on_signal();
    let syncing = tokio::spawn(status::run_sync(sync, SYNC_IDLE, shutdown.clone()));
    let app = status::router(StatusState { service, registry });
    let served = server::serve(app, cfg.http_port, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = syncing.await {
        tracing::warn!(reason = %e, "sync task failed");
    }
    tracing::info!("status service stopped");
    served.context("http server failed")
}
