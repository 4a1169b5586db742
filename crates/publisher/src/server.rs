//! Stage HTTP surface: `/health`, `/metrics`, `/v1/status`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Registry;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::store::CursorStore;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<CursorStore>,
    pub registry: Registry,
}

/// `GET /v1/status` body: per-epoch cursors as stored.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorStatus {
    pub last_processed_ticks: BTreeMap<u32, u32>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/status", get(status_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "UP"}))
}

async fn metrics_handler(State(st): State<ServerState>) -> impl IntoResponse {
    (StatusCode::OK, metrics::encode(&st.registry))
}

async fn status_handler(State(st): State<ServerState>) -> impl IntoResponse {
    match st.store.epoch_ticks() {
        Ok(last_processed_ticks) => (
            StatusCode::OK,
            Json(json!(CursorStatus { last_processed_ticks })),
        ),
        Err(e) => {
            tracing::error!(reason = %e, "reading cursors failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

/// Serves `app` on `port` until `shutdown` fires.
pub async fn serve(app: Router, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
