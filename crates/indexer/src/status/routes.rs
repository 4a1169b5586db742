use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Registry;
use serde_json::json;
use std::sync::Arc;

use qubic_publisher::metrics;

use super::service::{StatusError, StatusService};

#[derive(Clone)]
pub struct StatusState {
    pub service: Arc<StatusService>,
    pub registry: Registry,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/v1/status", get(status))
        .route("/v1/archiver/status", get(archiver_status))
        .route("/v1/tick-intervals", get(tick_intervals))
        .route("/v1/skipped-ticks", get(skipped_ticks))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "UP"}))
}

async fn metrics_text(State(st): State<StatusState>) -> impl IntoResponse {
    (StatusCode::OK, metrics::encode(&st.registry))
}

async fn status(State(st): State<StatusState>) -> Result<impl IntoResponse, StatusError> {
    Ok(Json(st.service.status()?))
}

async fn archiver_status(State(st): State<StatusState>) -> Result<impl IntoResponse, StatusError> {
    Ok(Json(st.service.archiver_status().await?))
}

async fn tick_intervals(State(st): State<StatusState>) -> Result<impl IntoResponse, StatusError> {
    let intervals = st.service.tick_intervals().await?;
    Ok(Json(json!({ "intervals": intervals })))
}

async fn skipped_ticks(State(st): State<StatusState>) -> Result<impl IntoResponse, StatusError> {
    let skipped = st.service.skipped_ticks()?;
    Ok(Json(json!({ "skippedTicks": skipped })))
}
