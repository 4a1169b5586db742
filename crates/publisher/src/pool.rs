//! Worker pool: bounded parallel per-tick fetches with a retry budget.
//!
//! At most `workers` fetches are in flight; each attempt carries its own
//! deadline. A tick that keeps failing is retried with capped backoff and,
//! once the budget is spent, reported as [FetchOutcome::Skipped] instead of
//! stalling the batch forever.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

/// Per-tick fetch deadline and retry budget.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            timeout: Duration::from_secs(20),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl FetchPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let base = exp.min(self.max_backoff);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
        base + jitter
    }
}

#[derive(Debug)]
pub enum FetchOutcome<T> {
    Fetched(T),
    /// Retry budget exhausted; `reason` is the last error.
    Skipped { reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("fetch worker for tick {tick} panicked or was cancelled")]
pub struct WorkerLost {
    pub tick: u32,
}

/// Bounded pool shared by every batch of a stage.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    policy: FetchPolicy,
}

impl WorkerPool {
    pub fn new(workers: usize, policy: FetchPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            policy,
        }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetches every tick and returns the outcomes sorted by tick. Returns only
    /// after all started workers have finished.
    pub async fn fetch_all<T, E, F, Fut>(
        &self,
        ticks: &[u32],
        fetch: F,
    ) -> Result<Vec<(u32, FetchOutcome<T>)>, WorkerLost>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(u32) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        let mut spawned = Vec::with_capacity(ticks.len());
        for &tick in ticks {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                return Err(WorkerLost { tick });
            };
            let fetch = fetch.clone();
            let policy = self.policy.clone();
            spawned.push(tick);
            set.spawn(async move {
                let _permit = permit;
                (tick, fetch_with_retry(tick, &fetch, &policy).await)
            });
        }

        let mut out = Vec::with_capacity(ticks.len());
        let mut lost = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => out.push(result),
                Err(e) => {
                    tracing::error!(reason = %e, "fetch worker failed");
                    lost.get_or_insert(e);
                }
            }
        }
        if lost.is_some() {
            let done: Vec<u32> = out.iter().map(|(t, _)| *t).collect();
            let tick = spawned
                .into_iter()
                .find(|t| !done.contains(t))
                .unwrap_or_default();
            return Err(WorkerLost { tick });
        }
        out.sort_by_key(|(tick, _)| *tick);
        Ok(out)
    }
}

async fn fetch_with_retry<T, E, F, Fut>(tick: u32, fetch: &F, policy: &FetchPolicy) -> FetchOutcome<T>
where
    E: Display,
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let err = match timeout(policy.timeout, fetch(tick)).await {
            Ok(Ok(value)) => return FetchOutcome::Fetched(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", policy.timeout),
        };
        attempt += 1;
        if attempt >= policy.attempts {
            tracing::error!(tick, attempts = attempt, reason = %err, "giving up on tick");
            return FetchOutcome::Skipped { reason: err };
        }
        tracing::warn!(tick, attempt, reason = %err, "tick fetch failed, retrying");
        sleep(policy.backoff(attempt - 1)).await;
    }
}
