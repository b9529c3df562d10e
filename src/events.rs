//! Throttle events and their log hooks.
//!
//! Every safelist hit and throttle match is published to the registered
//! notifiers. [`LogNotifier`] turns them into `tracing` events at the levels
//! from the config, and stays silent for a level that is not set.

use crate::config::LogLevel;
use axum::http::Method;
use std::net::IpAddr;
use std::time::Duration;

/// Something the throttler decided about a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// The client IP is safelisted; no throttle was consulted
    Safelisted {
        ip: IpAddr,
        method: Method,
        path: String,
    },
    /// A throttle's limit was exceeded
    Throttled {
        ip: Option<IpAddr>,
        method: Method,
        path: String,
        name: String,
        discriminator: String,
        count: u64,
        limit: u32,
        period: Duration,
    },
}

impl ThrottleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Safelisted { .. } => "safelist",
            Self::Throttled { .. } => "throttle",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Safelisted { ip, method, path } => {
                format!("Safelisted request from {} to {} {}", ip, method, path)
            }
            Self::Throttled {
                ip,
                method,
                path,
                name,
                discriminator,
                count,
                limit,
                period,
            } => format!(
                "Throttled request from {} to {} {}: {} matched {} ({}/{} in {}s)",
                display_ip(ip),
                method,
                path,
                name,
                discriminator,
                count,
                limit,
                period.as_secs()
            ),
        }
    }
}

/// Receives throttle events
pub trait ThrottleNotifier: Send + Sync {
    fn notify(&self, event: &ThrottleEvent);
}

impl<F> ThrottleNotifier for F
where
    F: Fn(&ThrottleEvent) + Send + Sync,
{
    fn notify(&self, event: &ThrottleEvent) {
        self(event)
    }
}

/// Logs throttle events through `tracing`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogNotifier {
    /// Level for throttle matches, `None` disables them
    pub tracks_level: Option<LogLevel>,
    /// Level for safelist hits, `None` disables them
    pub safelist_level: Option<LogLevel>,
}

impl LogNotifier {
    pub fn new(tracks_level: Option<LogLevel>, safelist_level: Option<LogLevel>) -> Self {
        Self {
            tracks_level,
            safelist_level,
        }
    }

    /// The level an event is logged at, if any
    pub fn level_for(&self, event: &ThrottleEvent) -> Option<LogLevel> {
        match event {
            ThrottleEvent::Safelisted { .. } => self.safelist_level,
            ThrottleEvent::Throttled { .. } => self.tracks_level,
        }
    }

    pub fn is_silent(&self) -> bool {
        self.tracks_level.is_none() && self.safelist_level.is_none()
    }
}

impl ThrottleNotifier for LogNotifier {
    fn notify(&self, event: &ThrottleEvent) {
        if let Some(level) = self.level_for(event) {
            log_event(level, event);
        }
    }
}

fn log_event(level: LogLevel, event: &ThrottleEvent) {
    let message = event.message();

    match event {
        ThrottleEvent::Safelisted { ip, method, path } => match level {
            LogLevel::Trace => {
                tracing::trace!(event = "safelist", ip = %ip, method = %method, path = %path, "{}", message)
            }
            LogLevel::Debug => {
                tracing::debug!(event = "safelist", ip = %ip, method = %method, path = %path, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(event = "safelist", ip = %ip, method = %method, path = %path, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(event = "safelist", ip = %ip, method = %method, path = %path, "{}", message)
            }
            LogLevel::Error => {
                tracing::error!(event = "safelist", ip = %ip, method = %method, path = %path, "{}", message)
            }
        },
        ThrottleEvent::Throttled {
            ip,
            method,
            path,
            name,
            discriminator,
            count,
            limit,
            period,
        } => {
            let ip = display_ip(ip);
            let period_secs = period.as_secs();
            match level {
                LogLevel::Trace => tracing::trace!(
                    event = "throttle",
                    ip = %ip,
                    method = %method,
                    path = %path,
                    throttle = %name,
                    discriminator = %discriminator,
                    count = *count,
                    limit = *limit,
                    period_secs,
                    "{}",
                    message
                ),
                LogLevel::Debug => tracing::debug!(
                    event = "throttle",
                    ip = %ip,
                    method = %method,
                    path = %path,
                    throttle = %name,
                    discriminator = %discriminator,
                    count = *count,
                    limit = *limit,
                    period_secs,
                    "{}",
                    message
                ),
                LogLevel::Info => tracing::info!(
                    event = "throttle",
                    ip = %ip,
                    method = %method,
                    path = %path,
                    throttle = %name,
                    discriminator = %discriminator,
                    count = *count,
                    limit = *limit,
                    period_secs,
                    "{}",
                    message
                ),
                LogLevel::Warn => tracing::warn!(
                    event = "throttle",
                    ip = %ip,
                    method = %method,
                    path = %path,
                    throttle = %name,
                    discriminator = %discriminator,
                    count = *count,
                    limit = *limit,
                    period_secs,
                    "{}",
                    message
                ),
                LogLevel::Error => tracing::error!(
                    event = "throttle",
                    ip = %ip,
                    method = %method,
                    path = %path,
                    throttle = %name,
                    discriminator = %discriminator,
                    count = *count,
                    limit = *limit,
                    period_secs,
                    "{}",
                    message
                ),
            }
        }
    }
}

fn display_ip(ip: &Option<IpAddr>) -> String {
    ip.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
