//! Elasticsearch over its REST API.
//!
//! Writes go through NDJSON `_bulk` into an alias (`require_alias`), one
//! `index` action per document so a replayed record replaces itself. Requests
//! answered with 429/502/503/504, or failing at the transport level, are
//! retried with capped exponential backoff. Any failed bulk item fails the
//! whole call.

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

use qubic_publisher::model::TickInterval;

#[derive(Debug, Error)]
pub enum ElasticError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("elasticsearch returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("{failed} of {total} bulk items failed, first error: {first}")]
    Items {
        failed: usize,
        total: usize,
        first: String,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("decode error: {0}")]
    Decode(String),
}

/// One bulk `index` action.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexAction {
    pub id: String,
    pub document: Value,
}

impl IndexAction {
    pub fn new<T: Serialize>(id: impl Into<String>, document: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            document: serde_json::to_value(document)?,
        })
    }
}

/// The Elasticsearch operations the consumers and the status service use.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Indexes every action or fails as a whole.
    async fn bulk_index(&self, index: &str, actions: Vec<IndexAction>) -> Result<(), ElasticError>;

    /// Stored intervals of the same epoch whose range overlaps any of
    /// `intervals`, sorted by `(epoch, from)`.
    async fn overlapping_intervals(
        &self,
        index: &str,
        intervals: &[TickInterval],
    ) -> Result<Vec<TickInterval>, ElasticError>;

    /// Every stored interval of epochs before `epoch`, sorted by `(epoch, from)`.
    async fn intervals_before_epoch(&self, index: &str, epoch: u32) -> Result<Vec<TickInterval>, ElasticError>;

    /// Number of transaction documents indexed for `tick`.
    async fn count_tick_transactions(&self, index: &str, tick: u32) -> Result<u64, ElasticError>;

    /// Highest `tickNumber` present in `index`, `None` when it is empty.
    async fn last_indexed_tick(&self, index: &str) -> Result<Option<u32>, ElasticError>;
}

/// NDJSON body for `_bulk`, newline terminated.
pub fn bulk_body(index: &str, actions: &[IndexAction]) -> Result<String, ElasticError> {
    let mut body = String::new();
    for action in actions {
        let meta = json!({"index": {"_index": index, "_id": action.id, "require_alias": true}});
        body.push_str(&meta.to_string());
        body.push('\n');
        body.push_str(
            &serde_json::to_string(&action.document).map_err(|e| ElasticError::Decode(e.to_string()))?,
        );
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Fails when any item of a `_bulk` response was not indexed.
fn check_bulk_response(response: Value) -> Result<(), ElasticError> {
    let parsed: BulkResponse =
        serde_json::from_value(response).map_err(|e| ElasticError::Decode(e.to_string()))?;
    let total = parsed.items.len();
    let failed: Vec<&BulkItem> = parsed
        .items
        .iter()
        .flat_map(|item| item.values())
        .filter(|item| item.error.is_some() || item.status >= 300)
        .collect();
    if let Some(first) = failed.first() {
        let reason = first
            .error
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| format!("status {}", first.status));
        return Err(ElasticError::Items {
            failed: failed.len(),
            total,
            first: format!("{}: {}", first.id, reason),
        });
    }
    if parsed.errors {
        return Err(ElasticError::Items {
            failed: 0,
            total,
            first: "response flagged errors".into(),
        });
    }
    Ok(())
}

fn retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

/// Backoff for overloaded or unreachable clusters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 15,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `min(initial * 2^attempt, max)` shifted by up to `±jitter`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_backoff);
        let jitter_ms = self.jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return base;
        }
        let shift = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        if shift >= 0 {
            base + Duration::from_millis(shift as u64)
        } else {
            base.saturating_sub(Duration::from_millis(shift.unsigned_abs()))
        }
    }
}

/// Elasticsearch client over `reqwest`.
pub struct HttpElastic {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    retry: RetryPolicy,
}

impl HttpElastic {
    pub fn new(
        base_url: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ElasticError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username,
            password,
            retry,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}/{}", self.base_url, path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// Sends the request built by `build`, retrying overload answers and
    /// transport failures, and returns the JSON body of the first success.
    async fn send<F>(&self, build: F) -> Result<Value, ElasticError>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempts = self.retry.max_retries.max(1);
        let mut last = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(self.retry.backoff(attempt - 1)).await;
            }
            let resp = match build().send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() || e.is_connect() => {
                    tracing::warn!(attempt, reason = %e, "elasticsearch unreachable, retrying");
                    last = e.to_string();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let status = resp.status();
            if status.is_success() {
                return Ok(resp.json().await?);
            }
            let body = resp.text().await.unwrap_or_default();
            if retryable(status) {
                tracing::warn!(attempt, status = status.as_u16(), "elasticsearch overloaded, retrying");
                last = format!("{status}: {body}");
                continue;
            }
            return Err(ElasticError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Err(ElasticError::Exhausted { attempts, last })
    }

    async fn search_page(&self, index: &str, query: &Value) -> Result<Vec<Value>, ElasticError> {
        let path = format!("{index}/_search");
        let resp = self
            .send(|| self.request(Method::POST, &path).json(query))
            .await?;
        let hits = resp
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(hits)
    }

    /// Every interval matching `query`, paged with `search_after` in
    /// `(epoch, from)` order.
    async fn search_intervals(&self, index: &str, query: Value) -> Result<Vec<TickInterval>, ElasticError> {
        let mut out = Vec::new();
        let mut search_after: Option<Value> = None;
        loop {
            let mut body = json!({
                "size": PAGE_SIZE,
                "query": query,
                "sort": [{"epoch": "asc"}, {"from": "asc"}],
            });
            if let Some(after) = &search_after {
                body["search_after"] = after.clone();
            }
            let hits = self.search_page(index, &body).await?;
            for hit in &hits {
                let source = hit
                    .get("_source")
                    .ok_or_else(|| ElasticError::Decode("hit without _source".into()))?;
                out.push(interval_from_source(source)?);
            }
            if hits.len() < PAGE_SIZE {
                break;
            }
            search_after = hits.last().and_then(|h| h.get("sort")).cloned();
            if search_after.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

const PAGE_SIZE: usize = 1000;

/// Query matching stored intervals that share an epoch with, and overlap, one
/// of `intervals`.
pub fn overlap_query(intervals: &[TickInterval]) -> Value {
    let clauses: Vec<Value> = intervals
        .iter()
        .map(|i| {
            json!({"bool": {"filter": [
                {"term": {"epoch": i.epoch}},
                {"range": {"from": {"lte": i.to}}},
                {"range": {"to": {"gte": i.from}}},
            ]}})
        })
        .collect();
    json!({"bool": {"should": clauses, "minimum_should_match": 1}})
}

fn interval_from_source(source: &Value) -> Result<TickInterval, ElasticError> {
    serde_json::from_value(source.clone()).map_err(|e| ElasticError::Decode(e.to_string()))
}

#[async_trait]
impl DocumentStore for HttpElastic {
    async fn bulk_index(&self, index: &str, actions: Vec<IndexAction>) -> Result<(), ElasticError> {
        if actions.is_empty() {
            return Ok(());
        }
        let body = bulk_body(index, &actions)?;
        let resp = self
            .send(|| {
                self.request(Method::POST, "_bulk")
                    .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;
        check_bulk_response(resp)?;
        tracing::debug!(index, count = actions.len(), "bulk indexed");
        Ok(())
    }

    async fn overlapping_intervals(
        &self,
        index: &str,
        intervals: &[TickInterval],
    ) -> Result<Vec<TickInterval>, ElasticError> {
        if intervals.is_empty() {
            return Ok(Vec::new());
        }
        self.search_intervals(index, overlap_query(intervals)).await
    }

    async fn intervals_before_epoch(&self, index: &str, epoch: u32) -> Result<Vec<TickInterval>, ElasticError> {
        self.search_intervals(index, json!({"range": {"epoch": {"lt": epoch}}}))
            .await
    }

    async fn count_tick_transactions(&self, index: &str, tick: u32) -> Result<u64, ElasticError> {
        let path = format!("{index}/_count");
        let query = json!({"query": {"term": {"tickNumber": tick}}});
        let resp = self
            .send(|| self.request(Method::POST, &path).json(&query))
            .await?;
        resp.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| ElasticError::Decode(format!("count missing in {resp}")))
    }

    async fn last_indexed_tick(&self, index: &str) -> Result<Option<u32>, ElasticError> {
        let path = format!("{index}/_search");
        let query = json!({"size": 0, "aggs": {"last_tick": {"max": {"field": "tickNumber"}}}});
        let resp = self
            .send(|| self.request(Method::POST, &path).json(&query))
            .await?;
        Ok(resp
            .pointer("/aggregations/last_tick/value")
            .and_then(Value::as_f64)
            .map(|v| v as u32))
    }
}
