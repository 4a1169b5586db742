use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Entry<K, V> {
    key: K,
    at: Instant,
    value: V,
}

/// Single-entry TTL cache. The lock is held across the refresh, so at most
/// one recomputation is in flight and concurrent readers wait for its result.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entry: Mutex<Option<Entry<K, V>>>,
}

impl<K: PartialEq, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Cached value for `key` if still fresh, otherwise the result of `refresh`
    /// (stored only on success).
    pub async fn get_or_refresh<E, F, Fut>(&self, key: K, refresh: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let mut entry = self.entry.lock().await;
        if let Some(e) = entry.as_ref() {
            if e.key == key && e.at.elapsed() < self.ttl {
                return Ok(e.value.clone());
            }
        }
        let value = refresh().await?;
        *entry = Some(Entry {
            key,
            at: Instant::now(),
            value: value.clone(),
        });
        Ok(value)
    }
}
