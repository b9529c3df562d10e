//! Throttling middleware for axum
//!
//! The service snapshots each request into a [`RequestInfo`], buffers the
//! body only when a parameter throttle needs it, and asks the [`Throttler`]
//! for a decision. Throttled requests get `429 Too Many Requests`; a body
//! that fails to read mid-stream gets `400 Bad Request`.

use crate::config::ThrottleConfig;
use crate::discriminator::RequestInfo;
use crate::error::Result;
use crate::params::{BodyKind, MAX_BODY_BYTES, parse_body};
use crate::proxy::TrustedProxies;
use crate::throttle::{Decision, Throttler};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
    http::{HeaderMap, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// JSON body of a throttled response
#[derive(serde::Serialize)]
struct ThrottledBody {
    error: String,
    message: String,
    retry_after: u64,
}

impl ThrottledBody {
    fn new(retry_after: u64) -> Self {
        Self {
            error: "rate_limit_exceeded".to_string(),
            message: format!(
                "Rate limit exceeded. Please try again in {} seconds",
                retry_after
            ),
            retry_after,
        }
    }
}

impl IntoResponse for ThrottledBody {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, self.retry_after.to_string())],
            axum::Json(self),
        )
            .into_response()
    }
}

/// JSON body answered when a request body cannot be read
#[derive(serde::Serialize)]
struct BodyReadError {
    error: String,
    message: String,
}

impl BodyReadError {
    fn new(source: &axum::Error) -> Self {
        Self {
            error: "invalid_request_body".to_string(),
            message: format!("Failed to read request body: {}", source),
        }
    }
}

impl IntoResponse for BodyReadError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, axum::Json(self)).into_response()
    }
}

/// Tower layer applying a [`Throttler`]
#[derive(Clone)]
pub struct ThrottleLayer {
    throttler: Arc<Throttler>,
    proxies: Arc<TrustedProxies>,
}

impl ThrottleLayer {
    /// Create a layer that trusts no proxy headers
    pub fn new(throttler: Throttler) -> Self {
        Self {
            throttler: Arc::new(throttler),
            proxies: Arc::new(TrustedProxies::default()),
        }
    }

    /// Resolve client IPs through these reverse proxies
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = Arc::new(proxies);
        self
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            throttler: self.throttler.clone(),
            proxies: self.proxies.clone(),
        }
    }
}

/// Tower service produced by [`ThrottleLayer`]
#[derive(Clone)]
pub struct ThrottleService<S> {
    inner: S,
    throttler: Arc<Throttler>,
    proxies: Arc<TrustedProxies>,
}

impl<S> Service<Request> for ThrottleService<S>
where
    S: Service<Request> + Clone + Send + Sync + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Use the instance that was driven to readiness
        let clone = self.inner.clone();
        let mut svc = std::mem::replace(&mut self.inner, clone);

        if !self.throttler.is_enabled() {
            return Box::pin(async move {
                let response = svc.call(req).await?;
                Ok(response.into_response())
            });
        }

        let throttler = self.throttler.clone();
        let proxies = self.proxies.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();

            let peer = parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip());
            let ip = proxies.client_ip(peer, &parts.headers);
            let mut info = RequestInfo::from_parts(&parts, ip);

            let body = if throttler.needs_params(&parts.method, parts.uri.path()) {
                match read_params(&parts, body, &mut info).await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(
                            path = %parts.uri.path(),
                            error = %e,
                            "Failed to read request body for throttling"
                        );
                        return Ok(BodyReadError::new(&e).into_response());
                    }
                }
            } else {
                body
            };

            if let Decision::Throttled { hit, .. } = throttler.check(&info).await {
                return Ok(ThrottledBody::new(hit.retry_after).into_response());
            }

            let response = svc.call(Request::from_parts(parts, body)).await?;
            Ok(response.into_response())
        })
    }
}

/// Decode the query and any form or JSON body into `info.params`
///
/// Returns a body carrying the same bytes for the inner service. Bodies over
/// [`MAX_BODY_BYTES`] contribute no parameters and are passed on as a stream
/// of the part already read followed by the rest.
async fn read_params(
    parts: &Parts,
    body: Body,
    info: &mut RequestInfo,
) -> std::result::Result<Body, axum::Error> {
    info.decode_query();

    let Some(kind) = param_body_kind(&parts.headers) else {
        return Ok(body);
    };
    if declared_length(&parts.headers).is_some_and(|len| len > MAX_BODY_BYTES) {
        return Ok(body);
    }

    let mut stream = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut size = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len();
        chunks.push(chunk);

        if size > MAX_BODY_BYTES {
            let prefix = futures::stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
            return Ok(Body::from_stream(prefix.chain(stream)));
        }
    }

    let bytes = match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.remove(0),
        _ => Bytes::from(chunks.concat()),
    };
    if let Some(params) = parse_body(kind, &bytes) {
        crate::params::merge(&mut info.params, params);
    }
    Ok(Body::from(bytes))
}

/// Form or JSON content type
fn param_body_kind(headers: &HeaderMap) -> Option<BodyKind> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(BodyKind::from_content_type)
}

/// `Content-Length`, when present and valid
fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Build a throttle layer from ThrottleConfig
///
/// Returns None if throttling is disabled. Trusted proxies come from
/// `TIDEWAY_TRUSTED_PROXIES` / `TRUSTED_PROXIES`.
pub fn build_throttle_layer(config: &ThrottleConfig) -> Result<Option<ThrottleLayer>> {
    if !config.enabled {
        return Ok(None);
    }

    let throttler = Throttler::from_config(config)?;
    Ok(Some(
        ThrottleLayer::new(throttler).with_trusted_proxies(TrustedProxies::from_env()),
    ))
}
