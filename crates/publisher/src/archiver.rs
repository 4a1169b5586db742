//! Archiver client: processed-interval status and per-tick payloads.
//!
//! Talks to the archiver's REST gateway. 64-bit integers may arrive as JSON
//! strings (gateway encoding) or numbers; both are accepted. A 404 on a
//! per-tick endpoint is the empty-tick sentinel.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::model::TickInterval;

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("tick {0} is empty")]
    EmptyTick(u32),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("archiver returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("archiver call timed out")]
    Timeout,
}

/// Latest tick known to the archiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickInfo {
    #[serde(default)]
    pub tick_number: u32,
    #[serde(default)]
    pub epoch: u32,
}

/// One `[initialProcessedTick, lastProcessedTick]` range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedInterval {
    #[serde(default)]
    pub initial_processed_tick: u32,
    #[serde(default)]
    pub last_processed_tick: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochIntervals {
    #[serde(default)]
    pub epoch: u32,
    #[serde(default)]
    pub intervals: Vec<ProcessedInterval>,
}

/// Archiver `GetStatus` result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiverStatus {
    #[serde(default)]
    pub last_processed_tick: TickInfo,
    #[serde(default)]
    pub processed_tick_intervals_per_epoch: Vec<EpochIntervals>,
}

impl ArchiverStatus {
    pub fn latest_tick(&self) -> u32 {
        self.last_processed_tick.tick_number
    }

    pub fn latest_epoch(&self) -> u32 {
        self.last_processed_tick.epoch
    }

    /// All intervals flattened and sorted by `(epoch, from)`.
    pub fn intervals(&self) -> Vec<TickInterval> {
        let mut out: Vec<TickInterval> = self
            .processed_tick_intervals_per_epoch
            .iter()
            .flat_map(|e| {
                e.intervals.iter().map(move |i| {
                    TickInterval::new(e.epoch, i.initial_processed_tick, i.last_processed_tick)
                })
            })
            .collect();
        out.sort_by_key(|i| (i.epoch, i.from));
        out
    }

    /// Intervals of one epoch, sorted by `from`.
    pub fn epoch_intervals(&self, epoch: u32) -> Vec<TickInterval> {
        self.intervals()
            .into_iter()
            .filter(|i| i.epoch == epoch)
            .collect()
    }

    /// Distinct epochs, ascending.
    pub fn epochs(&self) -> Vec<u32> {
        let mut epochs: Vec<u32> = self
            .processed_tick_intervals_per_epoch
            .iter()
            .map(|e| e.epoch)
            .collect();
        epochs.sort_unstable();
        epochs.dedup();
        epochs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedTransactionBody {
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub dest_id: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub amount: i64,
    #[serde(default)]
    pub tick_number: u32,
    #[serde(default)]
    pub input_type: u32,
    #[serde(default)]
    pub input_size: u32,
    #[serde(default)]
    pub input_hex: String,
    #[serde(default)]
    pub signature_hex: String,
    #[serde(default)]
    pub tx_id: String,
}

/// One entry of `GetTickTransactionsV2`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedTransaction {
    #[serde(default)]
    pub transaction: ArchivedTransactionBody,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub timestamp: u64,
    #[serde(default)]
    pub money_flew: bool,
}

#[derive(Debug, Deserialize)]
struct TickTransactionsResponse {
    #[serde(default)]
    transactions: Vec<ArchivedTransaction>,
}

/// `GetTickData` payload. Binary fields arrive base64 encoded and are kept as bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedTickData {
    #[serde(default)]
    pub computor_index: u32,
    #[serde(default)]
    pub epoch: u32,
    #[serde(default)]
    pub tick_number: u32,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub timestamp: u64,
    #[serde(default, deserialize_with = "base64_bytes")]
    pub var_struct: Vec<u8>,
    #[serde(default, deserialize_with = "base64_bytes")]
    pub time_lock: Vec<u8>,
    #[serde(default)]
    pub transaction_ids: Vec<String>,
    #[serde(default, deserialize_with = "lenient_i64_vec")]
    pub contract_fees: Vec<i64>,
    #[serde(default)]
    pub signature_hex: String,
}

impl ArchivedTickData {
    /// The archiver answers uninitialized ticks with an all-default body.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickDataResponse {
    #[serde(default)]
    tick_data: Option<ArchivedTickData>,
}

/// `GetComputors` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedComputors {
    #[serde(default)]
    pub epoch: u32,
    #[serde(default)]
    pub tick_number: u32,
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub signature_hex: String,
}

#[derive(Debug, Deserialize)]
struct ComputorsResponse {
    computors: Option<ArchivedComputors>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Signed(i64),
    Unsigned(u64),
    Text(String),
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match NumberOrString::deserialize(d)? {
        NumberOrString::Signed(n) => Ok(n),
        NumberOrString::Unsigned(n) => i64::try_from(n).map_err(de::Error::custom),
        NumberOrString::Text(s) => s.parse().map_err(de::Error::custom),
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match NumberOrString::deserialize(d)? {
        NumberOrString::Signed(n) => u64::try_from(n).map_err(de::Error::custom),
        NumberOrString::Unsigned(n) => Ok(n),
        NumberOrString::Text(s) => s.parse().map_err(de::Error::custom),
    }
}

fn lenient_i64_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<i64>, D::Error> {
    #[derive(Deserialize)]
    struct Lenient(#[serde(deserialize_with = "lenient_i64")] i64);
    let values: Vec<Lenient> = Vec::deserialize(d)?;
    Ok(values.into_iter().map(|Lenient(n)| n).collect())
}

fn base64_bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let s = Option::<String>::deserialize(d)?.unwrap_or_default();
    STANDARD.decode(s.as_bytes()).map_err(de::Error::custom)
}

/// Upstream archiver surface consumed by the producers and the status service.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn status(&self) -> Result<ArchiverStatus, ArchiverError>;

    /// Transactions of a tick; [ArchiverError::EmptyTick] when the tick has no payload.
    async fn tick_transactions(&self, tick: u32) -> Result<Vec<ArchivedTransaction>, ArchiverError>;

    /// Tick data; [ArchiverError::EmptyTick] when the tick has no payload.
    async fn tick_data(&self, tick: u32) -> Result<ArchivedTickData, ArchiverError>;

    async fn computors(&self, epoch: u32) -> Result<ArchivedComputors, ArchiverError>;
}

/// Archiver client over the REST gateway.
#[derive(Debug, Clone)]
pub struct HttpArchiver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArchiver {
    /// Every request carries `timeout` as its deadline.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ArchiverError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ArchiverError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.get(&url).send().await.map_err(timeout_or_http)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ArchiverError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ArchiverError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await.map_err(timeout_or_http)?;
        serde_json::from_slice(&bytes).map_err(|e| ArchiverError::Decode(e.to_string()))
    }
}

fn timeout_or_http(e: reqwest::Error) -> ArchiverError {
    if e.is_timeout() {
        ArchiverError::Timeout
    } else {
        ArchiverError::Http(e)
    }
}

fn empty_on_not_found(tick: u32, e: ArchiverError) -> ArchiverError {
    match e {
        ArchiverError::NotFound(_) => ArchiverError::EmptyTick(tick),
        other => other,
    }
}

#[async_trait]
impl Archiver for HttpArchiver {
    async fn status(&self) -> Result<ArchiverStatus, ArchiverError> {
        self.get_json("/v1/status").await
    }

    async fn tick_transactions(&self, tick: u32) -> Result<Vec<ArchivedTransaction>, ArchiverError> {
        let resp: TickTransactionsResponse = self
            .get_json(&format!("/v2/ticks/{tick}/transactions"))
            .await
            .map_err(|e| empty_on_not_found(tick, e))?;
        Ok(resp.transactions)
    }

    async fn tick_data(&self, tick: u32) -> Result<ArchivedTickData, ArchiverError> {
        let resp: TickDataResponse = self
            .get_json(&format!("/v1/ticks/{tick}/tick-data"))
            .await
            .map_err(|e| empty_on_not_found(tick, e))?;
        match resp.tick_data {
            Some(td) if !td.is_empty() => Ok(td),
            _ => Err(ArchiverError::EmptyTick(tick)),
        }
    }

    async fn computors(&self, epoch: u32) -> Result<ArchivedComputors, ArchiverError> {
        let resp: ComputorsResponse = self.get_json(&format!("/v1/epochs/{epoch}/computors")).await?;
        resp.computors
            .ok_or_else(|| ArchiverError::NotFound(format!("computors for epoch {epoch}")))
    }
}
