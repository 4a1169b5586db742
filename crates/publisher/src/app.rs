//! Process bootstrap shared by the publisher binaries.

use anyhow::Context;
use prometheus::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::archiver::HttpArchiver;
use crate::config::{PublisherConfig, StageDefaults};
use crate::metrics::Metrics;
use crate::producer::{run_stage, Stage, StageContext};
use crate::server::{self, ServerState};
use crate::sink::KafkaSink;
use crate::store::CursorStore;

/// Installs the global fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Token cancelled on SIGINT or SIGTERM.
pub fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(reason = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Wires config, store, archiver, Kafka and the HTTP surface, then runs the
/// stage built by `build` until shutdown or server failure.
pub async fn run_publisher<S, B>(defaults: StageDefaults, build: B) -> anyhow::Result<()>
where
    S: Stage + 'static,
    B: FnOnce(StageContext, &PublisherConfig) -> S,
{
    let cfg = PublisherConfig::load(&defaults).context("loading configuration")?;
    tracing::info!(topic = %cfg.kafka_topic, archiver = %cfg.archiver_host, "starting publisher");

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
    let kafka = Arc::new(
        KafkaSink::new(&cfg.kafka_brokers, cfg.kafka_topic.clone(), cfg.publish_timeout())
            .context("creating Kafka producer")?,
    );
    let shutdown = shutdown_on_signal();

    let ctx = StageContext {
        archiver,
        sink: kafka.clone(),
        store: Arc::clone(&store),
        metrics,
        shutdown: shutdown.clone(),
    };
    let stage = build(ctx, &cfg);
    if let Some((epoch, tick)) = cfg.cursor_override() {
        stage
            .apply_override(epoch, tick)
            .context("applying cursor override")?;
        tracing::warn!(epoch, tick, stage = stage.name(), "cursor overridden");
    }

    let app = server::router(ServerState { store, registry });
    let mut http = tokio::spawn(server::serve(app, cfg.metrics_port, shutdown.clone()));

    let (result, http_running) = tokio::select! {
        _ = run_stage(stage, cfg.cadence(), shutdown.clone()) => (Ok(()), true),
        joined = &mut http => (server_outcome(joined), false),
    };
    shutdown.cancel();

    if let Err(e) = kafka.flush() {
        tracing::warn!(reason = %e, "flushing Kafka producer failed");
    }
    if http_running {
        server_outcome(http.await)?;
    }
    tracing::info!("publisher stopped");
    result
}

fn server_outcome(
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.context("http server failed")),
        Err(e) => Err(anyhow::Error::new(e).context("http server task failed")),
    }
}
