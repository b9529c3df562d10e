use axum::{
    Router,
    routing::{get, post},
};
use serde_json::json;
use std::io;
use std::sync::{Arc, Mutex};
use tideway_throttle::{
    LogLevel, ThrottleConfig, ThrottleLayer, Throttler, TrustedProxies, build_throttle_layer,
    testing,
};
use tracing_subscriber::fmt::MakeWriter;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/throttle.yml");

fn fixture() -> ThrottleConfig {
    ThrottleConfig::from_file(FIXTURE).unwrap()
}

fn routes() -> Router {
    Router::new()
        .route("/app/users/sign_in", get(|| async { "form" }).post(|| async { "ok" }))
        .route("/app/otp", post(|| async { "ok" }))
        .route("/app/api/search", get(|| async { "ok" }))
        .route("/app/posts", post(|| async { "ok" }))
}

fn app_with(config: &ThrottleConfig, proxies: TrustedProxies) -> Router {
    let layer = ThrottleLayer::new(Throttler::from_config(config).unwrap())
        .with_trusted_proxies(proxies);
    routes().layer(layer)
}

fn app(config: &ThrottleConfig) -> Router {
    app_with(config, TrustedProxies::default())
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn test_fixture_paths_are_prefixed_and_normalized() {
    let config = fixture();
    let paths = config.protected_paths().unwrap();

    let all: Vec<&str> = paths.iter().map(|p| p.path.as_str()).collect();
    assert_eq!(all, vec!["/app/users/sign_in", "/app/otp", "/app/api/search"]);

    let methods: Vec<usize> = paths.iter().map(|p| p.methods.len()).collect();
    assert_eq!(methods, vec![1, 1, 0]);
}

#[test]
fn test_fixture_trusted_ips_are_safelisted() {
    let safelist = fixture().safelist().unwrap();
    assert_eq!(safelist.len(), 2);
    assert!(safelist.contains("127.0.0.1".parse().unwrap()));
    assert!(safelist.contains("10.20.99.1".parse().unwrap()));
    assert!(!safelist.contains("10.21.0.1".parse().unwrap()));
}

#[tokio::test]
async fn test_ip_throttle_on_protected_path() {
    let app = app(&fixture());

    for _ in 0..2 {
        testing::post(app.clone(), "/app/users/sign_in")
            .from_ip("203.0.113.7")
            .execute()
            .await
            .assert_ok();
    }

    let body: serde_json::Value = testing::post(app.clone(), "/app/users/sign_in")
        .from_ip("203.0.113.7")
        .execute()
        .await
        .assert_throttled()
        .json()
        .await;
    assert_eq!(body["error"], "rate_limit_exceeded");

    // Other clients and other methods are unaffected
    testing::post(app.clone(), "/app/users/sign_in")
        .from_ip("203.0.113.8")
        .execute()
        .await
        .assert_ok();
    testing::get(app, "/app/users/sign_in")
        .from_ip("203.0.113.7")
        .execute()
        .await
        .assert_ok();
}

#[tokio::test]
async fn test_unprotected_paths_are_never_throttled() {
    let app = app(&fixture());

    for _ in 0..5 {
        testing::post(app.clone(), "/app/posts")
            .from_ip("203.0.113.7")
            .execute()
            .await
            .assert_ok();
    }
}

#[tokio::test]
async fn test_form_param_discriminator_spans_ips() {
    let app = app(&fixture());

    for ip in ["198.51.100.1", "198.51.100.2"] {
        testing::post(app.clone(), "/app/users/sign_in")
            .from_ip(ip)
            .form_body(&[("user[email]", "a@example.com"), ("user[password]", "x")])
            .execute()
            .await
            .assert_ok();
    }

    testing::post(app.clone(), "/app/users/sign_in")
        .from_ip("198.51.100.3")
        .form_body(&[("user[email]", "a@example.com")])
        .execute()
        .await
        .assert_throttled();

    // A different email has its own bucket
    testing::post(app, "/app/users/sign_in")
        .from_ip("198.51.100.4")
        .form_body(&[("user[email]", "b@example.com")])
        .execute()
        .await
        .assert_ok();
}

#[tokio::test]
async fn test_json_param_discriminator() {
    let app = app(&fixture());

    for ip in ["198.51.100.1", "198.51.100.2"] {
        testing::post(app.clone(), "/app/otp")
            .from_ip(ip)
            .json_body(&json!({"phone": "+15550100"}))
            .execute()
            .await
            .assert_ok();
    }

    testing::post(app, "/app/otp")
        .from_ip("198.51.100.3")
        .json_body(&json!({"phone": "+15550100"}))
        .execute()
        .await
        .assert_throttled();
}

#[tokio::test]
async fn test_query_param_discriminator() {
    let app = app(&fixture());

    for ip in ["198.51.100.1", "198.51.100.2"] {
        testing::post(app.clone(), "/app/otp?phone=555")
            .from_ip(ip)
            .execute()
            .await
            .assert_ok();
    }

    testing::post(app, "/app/otp?phone=555")
        .from_ip("198.51.100.3")
        .execute()
        .await
        .assert_throttled();
}

#[tokio::test]
async fn test_header_discriminator_on_any_method_path() {
    let app = app(&fixture());

    for ip in ["198.51.100.1", "198.51.100.2"] {
        testing::get(app.clone(), "/app/api/search")
            .from_ip(ip)
            .header("x-api-key", "key-1")
            .execute()
            .await
            .assert_ok();
    }

    testing::get(app, "/app/api/search")
        .from_ip("198.51.100.3")
        .header("x-api-key", "key-1")
        .execute()
        .await
        .assert_throttled();
}

#[tokio::test]
async fn test_safelisted_ips_skip_throttles() {
    let app = app(&fixture());

    for ip in ["127.0.0.1", "10.20.5.5"] {
        for _ in 0..5 {
            testing::post(app.clone(), "/app/users/sign_in")
                .from_ip(ip)
                .form_body(&[("user[email]", "ops@example.com")])
                .execute()
                .await
                .assert_ok();
        }
    }
}

#[tokio::test]
async fn test_client_ip_through_trusted_proxy() {
    let app = app_with(&fixture(), TrustedProxies::from_list(&["192.0.2.10"]));

    for _ in 0..2 {
        testing::post(app.clone(), "/app/users/sign_in")
            .from_ip("192.0.2.10")
            .forwarded_for("203.0.113.50")
            .execute()
            .await
            .assert_ok();
    }

    // Another client behind the same proxy
    testing::post(app.clone(), "/app/users/sign_in")
        .from_ip("192.0.2.10")
        .forwarded_for("203.0.113.51")
        .execute()
        .await
        .assert_ok();

    testing::post(app.clone(), "/app/users/sign_in")
        .from_ip("192.0.2.10")
        .forwarded_for("203.0.113.50")
        .execute()
        .await
        .assert_throttled();

    // A forwarded safelisted client is recognized
    for _ in 0..3 {
        testing::post(app.clone(), "/app/users/sign_in")
            .from_ip("192.0.2.10")
            .forwarded_for("127.0.0.1")
            .execute()
            .await
            .assert_ok();
    }
}

#[tokio::test]
async fn test_forwarded_header_from_untrusted_peer_is_ignored() {
    let app = app(&fixture());

    // Rotating the header does not escape the peer's bucket
    for (i, spoofed) in ["1.1.1.1", "2.2.2.2", "3.3.3.3"].iter().enumerate() {
        let response = testing::post(app.clone(), "/app/users/sign_in")
            .from_ip("203.0.113.9")
            .forwarded_for(spoofed)
            .execute()
            .await;
        if i < 2 {
            response.assert_ok();
        } else {
            response.assert_throttled();
        }
    }

    // Claiming a safelisted address does not help either
    testing::post(app, "/app/users/sign_in")
        .from_ip("203.0.113.9")
        .forwarded_for("127.0.0.1")
        .execute()
        .await
        .assert_throttled();
}

#[tokio::test]
async fn test_logs_follow_configured_levels() {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    // tracks_log_level is warn, safelist_log_level is unset
    let app = app(&fixture());
    testing::post(app.clone(), "/app/users/sign_in")
        .from_ip("127.0.0.1")
        .execute()
        .await
        .assert_ok();
    for _ in 0..3 {
        testing::post(app.clone(), "/app/users/sign_in")
            .from_ip("203.0.113.7")
            .execute()
            .await;
    }

    let output = logs.contents();
    assert!(output.contains("WARN"));
    assert!(output.contains("Throttled request from 203.0.113.7"));
    assert!(!output.contains("Safelisted request"));

    let mut config = fixture();
    config.tracks_log_level = None;
    config.safelist_log_level = Some(LogLevel::Info);
    let app = self::app(&config);
    for _ in 0..3 {
        testing::post(app.clone(), "/app/users/sign_in")
            .from_ip("203.0.113.70")
            .execute()
            .await;
    }
    testing::post(app, "/app/users/sign_in")
        .from_ip("10.20.0.1")
        .execute()
        .await
        .assert_ok();

    let output = logs.contents();
    assert!(output.contains("Safelisted request from 10.20.0.1"));
    assert!(!output.contains("Throttled request from 203.0.113.70"));
}

#[tokio::test]
async fn test_load_through_config_file_override() {
    unsafe {
        std::env::set_var("TIDEWAY_THROTTLE_CONFIG_FILE", FIXTURE);
    }
    let path = ThrottleConfig::config_path();
    let config = ThrottleConfig::load();
    unsafe {
        std::env::remove_var("TIDEWAY_THROTTLE_CONFIG_FILE");
    }

    assert_eq!(path.to_str(), Some(FIXTURE));
    let config = config.unwrap();
    assert_eq!(config.limit, 2);

    let layer = build_throttle_layer(&config).unwrap().expect("enabled config builds a layer");
    let app = routes().layer(layer);
    testing::get(app, "/app/users/sign_in")
        .from_ip("203.0.113.7")
        .execute()
        .await
        .assert_ok();
}

#[test]
fn test_disabled_config_builds_no_layer() {
    let mut config = fixture();
    config.enabled = false;
    assert!(build_throttle_layer(&config).unwrap().is_none());
}
