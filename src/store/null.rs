use super::{Hit, ThrottleStore};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Store that counts nothing and never throttles
///
/// Useful for testing, or to keep the safelist and logging hooks wired while
/// throttling itself is switched off.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullStore;

#[async_trait]
impl ThrottleStore for NullStore {
    async fn hit(&self, _key: &str, limit: u32, _period: Duration) -> Result<Hit> {
        Ok(Hit::allowed(0, limit))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
