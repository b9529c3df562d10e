use super::{DEFAULT_NAMESPACE, Hit, ThrottleStore, Window};
use crate::config::CacheConfig;
use crate::error::{Result, ThrottleError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Increment and set the expiry in one step so a crash between the two
/// commands cannot leave a counter without a TTL.
const INCR_SCRIPT: &str = r"local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count";

/// Fixed-window counters shared through Redis
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    script: Arc<redis::Script>,
    namespace: String,
}

impl RedisStore {
    /// Create a new Redis store from a connection URL
    pub fn new(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ThrottleError::store(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            script: Arc::new(redis::Script::new(INCR_SCRIPT)),
            namespace: namespace.into(),
        })
    }

    /// Build from `cache.params[0]` or `cache.named_params.url`
    pub fn from_config(cache: &CacheConfig) -> Result<Self> {
        let url = cache
            .param_str(0)
            .or_else(|| cache.named_str("url"))
            .ok_or_else(|| {
                ThrottleError::config("cache.class redis needs a URL in params or named_params.url")
            })?;
        let namespace = cache.named_str("namespace").unwrap_or(DEFAULT_NAMESPACE);
        Self::new(url, namespace)
    }

    /// Get a connection from the Redis client
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ThrottleError::store(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl ThrottleStore for RedisStore {
    async fn hit(&self, key: &str, limit: u32, period: Duration) -> Result<Hit> {
        let window = Window::current(period);
        let mut conn = self.get_connection().await?;

        let count: i64 = self
            .script
            .key(window.key(&self.namespace, key))
            .arg(window.retry_after())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| ThrottleError::store(format!("Redis INCR failed: {}", e)))?;

        Ok(Hit::counted(count.max(0) as u64, limit, window.retry_after()))
    }

    fn is_healthy(&self) -> bool {
        self.client.get_connection().is_ok()
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
