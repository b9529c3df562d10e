//! Tideway Throttle - YAML-driven request throttling for axum
//!
//! Throttling is described by one YAML file: which paths are protected,
//! which request properties or parameters bucket the requests, the limit per
//! period, a safelist of client IPs, and the log levels for throttle and
//! safelist events. The crate turns that file into a tower layer.
//!
//! # Features
//!
//! - **Protected paths**: path + method pairs, joined onto an optional prefix
//! - **Discriminators**: bucket by IP, header, host, path or any request
//!   parameter (query, form or JSON body)
//! - **Counter stores**: in-memory (moka), Redis, or GCRA via governor
//! - **Safelist**: IPs and CIDR blocks that skip every throttle
//! - **Trusted proxies**: client IP resolution through `X-Forwarded-For`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::post};
//! use tideway_throttle::{ThrottleConfig, build_throttle_layer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tideway_throttle::init_tracing();
//!
//!     // TIDEWAY_THROTTLE_CONFIG_FILE, else config/throttle.yml
//!     let config = ThrottleConfig::load()?.with_env_overrides();
//!
//!     let mut app = Router::new().route("/users/sign_in", post(|| async { "ok" }));
//!     if let Some(layer) = build_throttle_layer(&config)? {
//!         app = app.layer(layer);
//!     }
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discriminator;
mod error;
pub mod events;
pub mod layer;
pub mod params;
pub mod paths;
pub mod proxy;
pub mod safelist;
pub mod store;
pub mod testing;
pub mod throttle;
pub mod utils;

// Re-exports for public API
pub use config::{
    CacheConfig, DEFAULT_CONFIG_PATH, LogLevel, ProtectedPathConfig, ThrottleConfig,
    ThrottleConfigBuilder,
};
pub use discriminator::{Discriminator, ParamPath, RequestAttribute, RequestInfo};
pub use error::{Result, ThrottleError};
pub use events::{LogNotifier, ThrottleEvent, ThrottleNotifier};
pub use layer::{ThrottleLayer, ThrottleService, build_throttle_layer};
pub use paths::{ProtectedPath, ProtectedPaths};
pub use proxy::{IpMatcher, TrustedProxies};
pub use safelist::Safelist;
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::{GovernorStore, Hit, MemoryStore, NullStore, ThrottleStore, build_store};
pub use throttle::{Decision, Throttle, Throttler};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "tideway_throttle=debug")
/// - `TIDEWAY_LOG_JSON` / `LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install(env_filter, json_logs);
}

/// Initialize tracing with an explicit filter directive and output format
pub fn init_tracing_with_config(level: &str, json: bool) {
    install(EnvFilter::new(level), json);
}

fn install(env_filter: EnvFilter, json: bool) {
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
