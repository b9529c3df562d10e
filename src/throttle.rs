//! Throttling engine
//!
//! Ties the pieces of a [`ThrottleConfig`] together: the safelist is checked
//! first, then the protected paths, then every throttle counts a hit for its
//! discriminator value. Events go out to the registered notifiers.

use crate::config::ThrottleConfig;
use crate::discriminator::{Discriminator, RequestInfo};
use crate::error::Result;
use crate::events::{LogNotifier, ThrottleEvent, ThrottleNotifier};
use crate::paths::ProtectedPaths;
use crate::safelist::Safelist;
use crate::store::{Hit, NullStore, ThrottleStore, build_store};
use axum::http::Method;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// A named bucket: requests sharing a discriminator value share a counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throttle {
    pub name: String,
    pub discriminator: Discriminator,
}

impl Throttle {
    pub fn new(name: impl Into<String>, discriminator: Discriminator) -> Self {
        Self {
            name: name.into(),
            discriminator,
        }
    }

    /// Counter key for a resolved discriminator value
    fn key(&self, value: &str) -> String {
        format!("{}:{}", self.name, value)
    }
}

/// What to do with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// The client IP is on the safelist
    Safelisted,
    Throttled {
        /// Name of the first throttle over its limit
        throttle: String,
        /// The discriminator value that was counted
        discriminator: String,
        hit: Hit,
    },
}

impl Decision {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Seconds the client should wait, if throttled
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Throttled { hit, .. } => Some(hit.retry_after),
            _ => None,
        }
    }
}

/// Runs the configured throttles against requests
#[derive(Clone)]
pub struct Throttler {
    enabled: bool,
    limit: u32,
    period: Duration,
    paths: Arc<ProtectedPaths>,
    safelist: Arc<Safelist>,
    throttles: Arc<Vec<Throttle>>,
    store: Arc<dyn ThrottleStore>,
    notifiers: Vec<Arc<dyn ThrottleNotifier>>,
}

impl Throttler {
    /// Build the throttler and the store named by `cache.class`
    pub fn from_config(config: &ThrottleConfig) -> Result<Self> {
        if !config.enabled {
            return Self::new(config, Arc::new(NullStore));
        }
        let store = build_store(&config.cache)?;
        Self::new(config, store)
    }

    /// Build the throttler around an existing store
    pub fn new(config: &ThrottleConfig, store: Arc<dyn ThrottleStore>) -> Result<Self> {
        let notifier: Arc<dyn ThrottleNotifier> = Arc::new(LogNotifier::new(
            config.tracks_log_level,
            config.safelist_log_level,
        ));

        if !config.enabled {
            return Ok(Self {
                enabled: false,
                limit: config.limit,
                period: config.period_duration(),
                paths: Arc::new(ProtectedPaths::default()),
                safelist: Arc::new(Safelist::default()),
                throttles: Arc::new(Vec::new()),
                store,
                notifiers: vec![notifier],
            });
        }

        config.validate()?;

        let throttles = config
            .throttle_discriminators()?
            .into_iter()
            .map(|(name, discriminator)| Throttle::new(name, discriminator))
            .collect::<Vec<_>>();

        let paths = config.protected_paths()?;
        let safelist = config.safelist()?;

        tracing::info!(
            store = store.name(),
            limit = config.limit,
            period_secs = config.period,
            protected_paths = paths.len(),
            throttles = throttles.len(),
            trusted_ips = safelist.len(),
            "Request throttling enabled"
        );

        Ok(Self {
            enabled: true,
            limit: config.limit,
            period: config.period_duration(),
            paths: Arc::new(paths),
            safelist: Arc::new(safelist),
            throttles: Arc::new(throttles),
            store,
            notifiers: vec![notifier],
        })
    }

    /// Register an extra event receiver alongside the log notifier
    pub fn with_notifier(mut self, notifier: impl ThrottleNotifier + 'static) -> Self {
        self.notifiers.push(Arc::new(notifier));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn throttles(&self) -> &[Throttle] {
        &self.throttles
    }

    pub fn store(&self) -> &Arc<dyn ThrottleStore> {
        &self.store
    }

    pub fn is_protected(&self, method: &Method, path: &str) -> bool {
        self.enabled && self.paths.is_protected(method, path)
    }

    pub fn is_safelisted(&self, ip: IpAddr) -> bool {
        self.enabled && self.safelist.contains(ip)
    }

    /// Whether checking this request may need its body parameters
    pub fn needs_params(&self, method: &Method, path: &str) -> bool {
        self.is_protected(method, path)
            && self.throttles.iter().any(|t| t.discriminator.reads_params())
    }

    /// Decide whether a request may proceed
    ///
    /// Every throttle with a resolvable discriminator counts the hit, even
    /// after an earlier one is over its limit. The first throttle over its
    /// limit decides. Store failures let the request through.
    pub async fn check(&self, request: &RequestInfo) -> Decision {
        if !self.enabled {
            return Decision::Allow;
        }

        if let Some(ip) = request.ip.filter(|ip| self.safelist.contains(*ip)) {
            self.notify(&ThrottleEvent::Safelisted {
                ip,
                method: request.method.clone(),
                path: request.path.clone(),
            });
            return Decision::Safelisted;
        }

        if !self.paths.is_protected(&request.method, &request.path) {
            return Decision::Allow;
        }

        let mut decision = Decision::Allow;

        for throttle in self.throttles.iter() {
            let Some(value) = throttle.discriminator.resolve(request) else {
                continue;
            };

            let hit = match self
                .store
                .hit(&throttle.key(&value), self.limit, self.period)
                .await
            {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(
                        store = self.store.name(),
                        throttle = %throttle.name,
                        error = %e,
                        "Throttle store failed, allowing request"
                    );
                    continue;
                }
            };

            if hit.throttled && !decision.is_throttled() {
                self.notify(&ThrottleEvent::Throttled {
                    ip: request.ip,
                    method: request.method.clone(),
                    path: request.path.clone(),
                    name: throttle.name.clone(),
                    discriminator: value.clone(),
                    count: hit.count,
                    limit: hit.limit,
                    period: self.period,
                });
                decision = Decision::Throttled {
                    throttle: throttle.name.clone(),
                    discriminator: value,
                    hit,
                };
            }
        }

        decision
    }

    fn notify(&self, event: &ThrottleEvent) {
        for notifier in &self.notifiers {
            notifier.notify(event);
        }
    }
}
