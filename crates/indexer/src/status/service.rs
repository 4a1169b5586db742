use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use qubic_publisher::archiver::{Archiver, ArchiverError};
use qubic_publisher::model::TickInterval;
use qubic_publisher::store::{CursorStore, OrZero, SkippedTick, StoreError};

use super::cache::TtlCache;
use super::reconcile::{derive_status, reconcile_intervals, DerivedStatus};
use crate::elastic::{DocumentStore, ElasticError};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("archiver: {0}")]
    Archiver(#[from] ArchiverError),
    #[error("elasticsearch: {0}")]
    Elastic(#[from] ElasticError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        tracing::error!(reason = %self, "status request failed");
        let code = match self {
            StatusError::Archiver(_) | StatusError::Elastic(_) => StatusCode::BAD_GATEWAY,
            StatusError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, Json(json!({"error": self.to_string()}))).into_response()
    }
}

/// `GET /v1/status` body: the verified cursor plus the per-epoch cursors in
/// the same shape the publisher stages serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStatus {
    pub last_processed_tick: u32,
    pub epoch: u32,
    pub last_processed_ticks: BTreeMap<u32, u32>,
}

/// Read side of the status service: verified cursor, reconciled intervals and
/// the derived archiver-compatible status.
pub struct StatusService {
    archiver: Arc<dyn Archiver>,
    elastic: Arc<dyn DocumentStore>,
    intervals_index: String,
    store: Arc<CursorStore>,
    historical: TtlCache<u32, Vec<TickInterval>>,
    derived: TtlCache<(), DerivedStatus>,
}

impl StatusService {
    pub fn new(
        archiver: Arc<dyn Archiver>,
        elastic: Arc<dyn DocumentStore>,
        intervals_index: impl Into<String>,
        store: Arc<CursorStore>,
        cache_ttl: Duration,
        status_cache_ttl: Duration,
    ) -> Self {
        Self {
            archiver,
            elastic,
            intervals_index: intervals_index.into(),
            store,
            historical: TtlCache::new(cache_ttl),
            derived: TtlCache::new(status_cache_ttl),
        }
    }

    pub fn status(&self) -> Result<ProcessingStatus, StatusError> {
        Ok(ProcessingStatus {
            last_processed_tick: self.store.last_processed_tick().or_zero()?,
            epoch: self.store.last_processed_epoch().or_zero()?,
            last_processed_ticks: self.store.epoch_ticks()?,
        })
    }

    /// Historical intervals from Elasticsearch plus the current epoch's from
    /// the archiver, clamped to the verified tick.
    pub async fn tick_intervals(&self) -> Result<Vec<TickInterval>, StatusError> {
        let status = self.archiver.status().await?;
        let last_processed_tick = self.store.last_processed_tick().or_zero()?;
        let epoch = status.latest_epoch();
        let historical = self
            .historical
            .get_or_refresh(epoch, || {
                self.elastic.intervals_before_epoch(&self.intervals_index, epoch)
            })
            .await?;
        let current = status.epoch_intervals(epoch);
        Ok(reconcile_intervals(&historical, &current, last_processed_tick))
    }

    pub async fn archiver_status(&self) -> Result<DerivedStatus, StatusError> {
        self.derived
            .get_or_refresh((), || async {
                let intervals = self.tick_intervals().await?;
                let last_processed_tick = self.store.last_processed_tick().or_zero()?;
                Ok::<_, StatusError>(derive_status(&intervals, last_processed_tick))
            })
            .await
    }

    pub fn skipped_ticks(&self) -> Result<Vec<SkippedTick>, StatusError> {
        Ok(self.store.skipped_ticks()?)
    }
}
