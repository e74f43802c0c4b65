//! Time-expiring cache for data fetched from vendor CLIs (location lists)

use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Recommended lifetime of a cached location list
pub const LOCATION_TTL: Duration = Duration::from_secs(60 * 60);

struct Entry<T> {
    value: T,
    fetched_at: Instant,
}

/// Read-mostly cache holding one value for `ttl`.
///
/// Readers share the read lock on the fast path. A refresh holds the write
/// lock for the whole fetch and re-checks freshness after acquiring it, so
/// concurrent callers on an expired entry trigger exactly one fetch.
pub struct ExpiringCache<T> {
    ttl: Duration,
    slot: RwLock<Option<Entry<T>>>,
}

pub type LocationCache = ExpiringCache<Vec<String>>;

impl<T: Clone> ExpiringCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: RwLock::new(None),
        }
    }

    fn fresh(&self, slot: &Option<Entry<T>>) -> Option<T> {
        slot.as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Cached value if still fresh, otherwise the result of `fetch`.
    ///
    /// A fetch yielding `None` is not cached, so the next call retries.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        if let Some(value) = self.fresh(&*self.slot.read().await) {
            return Some(value);
        }

        let mut slot = self.slot.write().await;
        if let Some(value) = self.fresh(&slot) {
            return Some(value);
        }

        debug!("Cache expired, refreshing");
        let value = fetch().await?;
        *slot = Some(Entry {
            value: value.clone(),
            fetched_at: Instant::now(),
        });
        Some(value)
    }
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new(LOCATION_TTL)
    }
}
