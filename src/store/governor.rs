//! GCRA counter store backed by governor
//!
//! Instead of fixed windows, each key gets a token bucket holding `limit`
//! cells that refill evenly over `period`. Bursts at a window edge cannot
//! double the allowed rate. One keyed limiter is kept per distinct
//! limit/period pair.

use super::{Hit, ThrottleStore};
use crate::error::{Result, ThrottleError};
use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DashMapStateStore,
};
use std::num::NonZeroU32;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

/// Shrink the keyed state stores every N hits to drop stale keys.
const SHRINK_INTERVAL: u64 = 1000;

type KeyedLimiter =
    RateLimiter<String, DashMapStateStore<String>, DefaultClock, StateInformationMiddleware>;

/// Token-bucket counters in process memory
#[derive(Clone, Default)]
pub struct GovernorStore {
    limiters: Arc<DashMap<(u32, Duration), Arc<KeyedLimiter>>>,
    hit_count: Arc<AtomicU64>,
}

impl GovernorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn limiter(&self, limit: u32, period: Duration) -> Result<Arc<KeyedLimiter>> {
        if let Some(limiter) = self.limiters.get(&(limit, period)) {
            return Ok(limiter.clone());
        }

        let burst = NonZeroU32::new(limit)
            .ok_or_else(|| ThrottleError::store("governor store requires a limit above 0"))?;
        let quota = Quota::with_period(period / limit)
            .ok_or_else(|| ThrottleError::store("governor store requires a period above 0"))?
            .allow_burst(burst);

        let limiter = self
            .limiters
            .entry((limit, period))
            .or_insert_with(|| {
                Arc::new(RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>())
            })
            .clone();
        Ok(limiter)
    }

    /// Periodically drop keys whose buckets are full again
    fn maybe_shrink(&self) {
        let count = self.hit_count.fetch_add(1, Ordering::Relaxed);
        if count % SHRINK_INTERVAL == 0 && count > 0 {
            for limiter in self.limiters.iter() {
                limiter.retain_recent();
            }
        }
    }

    fn check(&self, key: &str, limit: u32, period: Duration) -> Result<Hit> {
        self.maybe_shrink();
        let limiter = self.limiter(limit, period)?;

        match limiter.check_key(&key.to_string()) {
            Ok(snapshot) => {
                let used = limit.saturating_sub(snapshot.remaining_burst_capacity());
                Ok(Hit::allowed(u64::from(used), limit))
            }
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());
                let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                Ok(Hit::counted(
                    u64::from(limit) + 1,
                    limit,
                    retry_after.max(1),
                ))
            }
        }
    }
}

#[async_trait]
impl ThrottleStore for GovernorStore {
    async fn hit(&self, key: &str, limit: u32, period: Duration) -> Result<Hit> {
        self.check(key, limit, period)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "governor"
    }
}
