//! In-memory counter store backed by moka
//!
//! Counters live in a bounded concurrent cache and expire when their window
//! closes, so memory stays proportional to the number of active clients.

use super::{DEFAULT_NAMESPACE, Hit, ThrottleStore, Window};
use crate::config::CacheConfig;
use crate::error::Result;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default maximum number of live counters
const DEFAULT_MAX_ENTRIES: u64 = 100_000;

/// Counter for one key in one window
#[derive(Clone)]
struct Counter {
    hits: Arc<AtomicU64>,
    /// Time left in the window when the counter was created
    ttl: Duration,
}

/// Expire each counter at the end of its window
struct WindowExpiry;

impl Expiry<String, Counter> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Counter,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Fixed-window counters in process memory
///
/// Counters are not shared between processes; use the Redis store when
/// several instances sit behind one load balancer.
#[derive(Clone)]
pub struct MemoryStore {
    inner: MokaCache<String, Counter>,
    namespace: String,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` live counters
    pub fn new(max_entries: u64) -> Self {
        Self::with_namespace(max_entries, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(max_entries: u64, namespace: impl Into<String>) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(WindowExpiry)
            .build();

        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    /// Build from `cache.named_params` (`max_entries`, `namespace`)
    pub fn from_config(cache: &CacheConfig) -> Result<Self> {
        let max_entries = cache
            .named_u64("max_entries")?
            .unwrap_or(DEFAULT_MAX_ENTRIES);
        let namespace = cache.named_str("namespace").unwrap_or(DEFAULT_NAMESPACE);
        Ok(Self::with_namespace(max_entries, namespace))
    }

    /// Run pending maintenance tasks (eviction, expiration)
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Get the current number of live counters
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    async fn hit_in_window(&self, key: &str, limit: u32, window: Window) -> Hit {
        let counter = self
            .inner
            .entry(window.key(&self.namespace, key))
            .or_insert_with(async {
                Counter {
                    hits: Arc::new(AtomicU64::new(0)),
                    ttl: window.remaining,
                }
            })
            .await
            .into_value();

        let count = counter.hits.fetch_add(1, Ordering::AcqRel) + 1;
        Hit::counted(count, limit, window.retry_after())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl ThrottleStore for MemoryStore {
    async fn hit(&self, key: &str, limit: u32, period: Duration) -> Result<Hit> {
        Ok(self.hit_in_window(key, limit, Window::current(period)).await)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(number: u64) -> Window {
        Window {
            number,
            remaining: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_counts_up_to_limit() {
        let store = MemoryStore::new(100);

        for expected in 1..=3 {
            let hit = store.hit_in_window("ip:1.2.3.4", 3, window(7)).await;
            assert_eq!(hit.count, expected);
            assert!(!hit.throttled);
        }

        let hit = store.hit_in_window("ip:1.2.3.4", 3, window(7)).await;
        assert_eq!(hit.count, 4);
        assert!(hit.throttled);
        assert_eq!(hit.retry_after, 30);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = MemoryStore::new(100);
        store.hit_in_window("ip:1.1.1.1", 1, window(1)).await;

        let other = store.hit_in_window("ip:2.2.2.2", 1, window(1)).await;
        assert_eq!(other.count, 1);
        assert!(!other.throttled);
    }

    #[tokio::test]
    async fn test_new_window_resets_count() {
        let store = MemoryStore::new(100);
        store.hit_in_window("k", 1, window(1)).await;
        assert!(store.hit_in_window("k", 1, window(1)).await.throttled);

        let next = store.hit_in_window("k", 1, window(2)).await;
        assert_eq!(next.count, 1);
        assert!(!next.throttled);
    }

    #[tokio::test]
    async fn test_counters_expire_with_window() {
        let store = MemoryStore::new(100);
        let short = Window {
            number: 1,
            remaining: Duration::from_millis(20),
        };
        store.hit_in_window("k", 5, short).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        store.run_pending_tasks().await;

        assert_eq!(store.hit_in_window("k", 5, short).await.count, 1);
    }

    #[tokio::test]
    async fn test_trait_hit_uses_current_window() {
        let store = MemoryStore::default();
        let hit = store.hit("k", 2, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(hit.count, 1);
        assert_eq!(hit.limit, 2);
    }

    #[tokio::test]
    async fn test_concurrent_hits_are_all_counted() {
        let store = Arc::new(MemoryStore::new(1000));

        let mut handles = vec![];
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.hit_in_window("shared", 1000, window(1)).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let hit = store.hit_in_window("shared", 1000, window(1)).await;
        assert_eq!(hit.count, 501);
    }

    #[test]
    fn test_from_config() {
        let cache = CacheConfig::new("memory")
            .with_named_param("max_entries", 10u64)
            .with_named_param("namespace", "app");
        let store = MemoryStore::from_config(&cache).unwrap();
        assert_eq!(store.namespace, "app");

        let bad = CacheConfig::new("memory").with_named_param("max_entries", "many");
        assert!(MemoryStore::from_config(&bad).is_err());
    }
}
