//! Fluent request scenarios for testing throttled routers
//!
//! Requests run through the router with `oneshot`, so no server is started.
//! [`Scenario::from_ip`] sets the connection address the throttle sees.
//!
//! # Example
//!
//! ```rust,ignore
//! use tideway_throttle::testing;
//!
//! #[tokio::test]
//! async fn test_login_is_throttled() {
//!     let app = throttled_app();
//!
//!     for _ in 0..5 {
//!         testing::post(app.clone(), "/users/sign_in")
//!             .from_ip("203.0.113.7")
//!             .execute()
//!             .await
//!             .assert_ok();
//!     }
//!
//!     testing::post(app, "/users/sign_in")
//!         .from_ip("203.0.113.7")
//!         .execute()
//!         .await
//!         .assert_throttled();
//! }
//! ```

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{HeaderName, Method, Request, StatusCode, header},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower::ServiceExt;

/// Test request builder
pub struct Scenario {
    app: Router,
    request: Request<Body>,
}

impl Scenario {
    /// Create a new test scenario with the given app
    pub fn new(app: Router) -> Self {
        Self {
            app,
            request: Request::builder()
                .method(Method::GET)
                .uri("/")
                .body(Body::empty())
                .unwrap(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        *self.request.method_mut() = method;
        self
    }

    /// Set the URI, query string included
    pub fn uri(mut self, uri: &str) -> Self {
        *self.request.uri_mut() = uri.parse().unwrap();
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.request.headers_mut().insert(
            HeaderName::from_bytes(key.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        self
    }

    /// Set the peer address as if the request arrived over a connection
    pub fn from_ip(mut self, ip: &str) -> Self {
        let addr = SocketAddr::new(ip.parse().unwrap(), 40000);
        self.request.extensions_mut().insert(ConnectInfo(addr));
        self
    }

    /// Append an `X-Forwarded-For` hop
    pub fn forwarded_for(mut self, chain: &str) -> Self {
        self.request
            .headers_mut()
            .append("x-forwarded-for", chain.parse().unwrap());
        self
    }

    /// Set a urlencoded form body
    pub fn form_body(self, pairs: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.raw_body("application/x-www-form-urlencoded", body)
    }

    /// Set JSON body from a serializable type
    pub fn json_body<T: Serialize>(self, body: &T) -> Self {
        let json = serde_json::to_string(body).unwrap();
        self.raw_body("application/json", json)
    }

    /// Set a body with an explicit content type
    pub fn raw_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        let body = body.into();
        let headers = self.request.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
        headers.insert(header::CONTENT_LENGTH, body.len().into());
        *self.request.body_mut() = Body::from(body);
        self
    }

    /// Execute the request and get an assertion builder
    pub async fn execute(self) -> ScenarioAssert {
        let response = self.app.oneshot(self.request).await.unwrap();
        ScenarioAssert { response }
    }
}

/// Assertion builder for test responses
pub struct ScenarioAssert {
    response: axum::response::Response,
}

impl ScenarioAssert {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Assert the response status code
    pub fn assert_status(self, expected: StatusCode) -> Self {
        assert_eq!(
            self.response.status(),
            expected,
            "Expected status {}, got {}",
            expected,
            self.response.status()
        );
        self
    }

    /// Assert status is 200 OK
    pub fn assert_ok(self) -> Self {
        self.assert_status(StatusCode::OK)
    }

    /// Assert status is 429 with a Retry-After header
    pub fn assert_throttled(self) -> Self {
        let this = self.assert_status(StatusCode::TOO_MANY_REQUESTS);
        assert!(
            this.response.headers().contains_key(header::RETRY_AFTER),
            "Throttled response is missing Retry-After"
        );
        this
    }

    /// Assert a header exists with the given value
    pub fn assert_header(self, key: &str, expected: &str) -> Self {
        let value = self
            .response
            .headers()
            .get(key)
            .unwrap_or_else(|| panic!("Header '{}' not found", key))
            .to_str()
            .unwrap();
        assert_eq!(value, expected, "Header '{}' value mismatch", key);
        self
    }

    /// Get the response body as a string
    pub async fn body_string(self) -> String {
        let bytes = axum::body::to_bytes(self.response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Parse the JSON response body into a type
    pub async fn json<T: for<'de> Deserialize<'de>>(self) -> T {
        let body = self.body_string().await;
        serde_json::from_str(&body).expect("Failed to parse JSON response")
    }

    /// Get the underlying response for custom assertions
    pub fn response(self) -> axum::response::Response {
        self.response
    }
}

/// Convenience function to create a GET request scenario
pub fn get(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::GET).uri(uri)
}

/// Convenience function to create a POST request scenario
pub fn post(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::POST).uri(uri)
}

/// Convenience function to create a PUT request scenario
pub fn put(app: Router, uri: &str) -> Scenario {
    Scenario::new(app).method(Method::PUT).uri(uri)
}
