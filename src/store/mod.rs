//! Counter stores backing the throttles.
//!
//! A store counts hits per key and decides whether the limit for the current
//! period is exceeded. The in-memory store is used by default; Redis shares
//! counters between processes (requires the `redis` feature) and governor
//! swaps fixed windows for GCRA.

mod governor;
mod memory;
mod null;

#[cfg(feature = "redis")]
mod redis;

pub use self::governor::GovernorStore;
pub use memory::MemoryStore;
pub use null::NullStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use crate::config::CacheConfig;
use crate::error::{Result, ThrottleError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Key namespace used when `named_params.namespace` is not set
pub const DEFAULT_NAMESPACE: &str = "throttle";

/// Outcome of counting one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    /// Hits counted in the current period, including this one
    pub count: u64,
    pub limit: u32,
    pub throttled: bool,
    /// Seconds until the client may retry (0 when not throttled)
    pub retry_after: u64,
}

impl Hit {
    /// A fixed-window count: throttled once `count` exceeds `limit`
    pub fn counted(count: u64, limit: u32, retry_after: u64) -> Self {
        let throttled = count > u64::from(limit);
        Self {
            count,
            limit,
            throttled,
            retry_after: if throttled { retry_after } else { 0 },
        }
    }

    pub fn allowed(count: u64, limit: u32) -> Self {
        Self {
            count,
            limit,
            throttled: false,
            retry_after: 0,
        }
    }
}

/// Counts throttle hits
#[async_trait]
pub trait ThrottleStore: Send + Sync {
    /// Count a hit for `key` and report whether `limit` per `period` is exceeded
    async fn hit(&self, key: &str, limit: u32, period: Duration) -> Result<Hit>;

    /// Check if the store backend is healthy
    fn is_healthy(&self) -> bool;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// The fixed window a timestamp falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub number: u64,
    pub remaining: Duration,
}

impl Window {
    pub fn current(period: Duration) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::at(now, period)
    }

    pub fn at(now: Duration, period: Duration) -> Self {
        let period_secs = period.as_secs().max(1);
        let number = now.as_secs() / period_secs;
        let end = Duration::from_secs((number + 1) * period_secs);
        Self {
            number,
            remaining: end.saturating_sub(now),
        }
    }

    /// Remaining time rounded up to whole seconds, at least 1
    pub fn retry_after(&self) -> u64 {
        let secs = self.remaining.as_secs() + u64::from(self.remaining.subsec_nanos() > 0);
        secs.max(1)
    }

    pub fn key(&self, namespace: &str, key: &str) -> String {
        format!("{}:{}:{}", namespace, self.number, key)
    }
}

/// Build the store named by `cache.class`
///
/// Class names are case-insensitive and may carry a `_store` suffix
/// (`memory_store`, `RedisStore`).
pub fn build_store(cache: &CacheConfig) -> Result<Arc<dyn ThrottleStore>> {
    let class = normalize_class(&cache.class);

    let store: Arc<dyn ThrottleStore> = match class.as_str() {
        "memory" | "inmemory" => Arc::new(MemoryStore::from_config(cache)?),
        "governor" => Arc::new(GovernorStore::new()),
        "null" | "noop" => Arc::new(NullStore),
        "redis" => {
            #[cfg(feature = "redis")]
            {
                Arc::new(RedisStore::from_config(cache)?)
            }
            #[cfg(not(feature = "redis"))]
            {
                return Err(ThrottleError::config(
                    "cache.class redis requires the `redis` feature",
                ));
            }
        }
        _ => {
            return Err(ThrottleError::config(format!(
                "Unknown cache store class: {}",
                cache.class
            )));
        }
    };

    tracing::debug!(store = store.name(), "Built throttle counter store");
    Ok(store)
}

pub(crate) fn normalize_class(class: &str) -> String {
    let lower = class.trim().to_ascii_lowercase().replace(['-', '_'], "");
    lower
        .strip_suffix("store")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or(lower)
}
