//! Discriminators: the value a throttle buckets requests by.
//!
//! A discriminator reads either a request attribute (`ip`, `user_agent`,
//! `header.x-api-key`, ...) or a request parameter path (`user.email`).
//! Requests whose discriminator resolves to nothing are not counted.

use crate::error::{Result, ThrottleError};
use axum::http::{HeaderMap, HeaderName, Method, header, request::Parts};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A request attribute addressed by a property path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAttribute {
    /// Resolved client IP (after trusted proxy handling)
    Ip,
    Path,
    Method,
    Host,
    UserAgent,
    Referer,
    QueryString,
    Scheme,
    /// Any request header, e.g. `header.x-api-key`
    Header(HeaderName),
}

impl FromStr for RequestAttribute {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        let property = s.trim();
        let lower = property.to_ascii_lowercase();

        let attribute = match lower.as_str() {
            "ip" | "remote_ip" => Self::Ip,
            "path" => Self::Path,
            "method" | "request_method" => Self::Method,
            "host" => Self::Host,
            "user_agent" => Self::UserAgent,
            "referer" | "referrer" => Self::Referer,
            "query" | "query_string" => Self::QueryString,
            "scheme" => Self::Scheme,
            _ => {
                let name = lower
                    .strip_prefix("header.")
                    .or_else(|| lower.strip_prefix("headers."))
                    .ok_or_else(|| {
                        ThrottleError::config(format!("Unknown request property: {}", property))
                    })?;
                let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    ThrottleError::config(format!("Invalid header name in property: {}", property))
                })?;
                Self::Header(header)
            }
        };

        Ok(attribute)
    }
}

impl fmt::Display for RequestAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::Path => f.write_str("path"),
            Self::Method => f.write_str("method"),
            Self::Host => f.write_str("host"),
            Self::UserAgent => f.write_str("user_agent"),
            Self::Referer => f.write_str("referer"),
            Self::QueryString => f.write_str("query_string"),
            Self::Scheme => f.write_str("scheme"),
            Self::Header(name) => write!(f, "header.{}", name),
        }
    }
}

/// Path into the nested request parameters, e.g. `["user", "email"]`
///
/// Deserializes from a YAML list, a dotted string (`user.email`) or a
/// bracket string (`user[email]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamPath(Vec<String>);

impl ParamPath {
    pub fn new(segments: Vec<String>) -> Result<Self> {
        if segments.is_empty() || segments.iter().any(|s| s.trim().is_empty()) {
            return Err(ThrottleError::config(format!(
                "Invalid param path: {:?}",
                segments
            )));
        }
        Ok(Self(segments))
    }

    pub fn parse(path: &str) -> Result<Self> {
        let segments = path
            .split(['.', '[', ']'])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        Self::new(segments).map_err(|_| ThrottleError::config(format!("Invalid param path: {}", path)))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Walk the parameter tree; numeric segments index into arrays
    pub fn dig<'a>(&self, params: &'a Value) -> Option<&'a Value> {
        self.0.iter().try_fold(params, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl<'de> Deserialize<'de> for ParamPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Segments(Vec<String>),
            Path(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Segments(segments) => ParamPath::new(segments),
            Raw::Path(path) => ParamPath::parse(&path),
        }
        .map_err(serde::de::Error::custom)
    }
}

impl Serialize for ParamPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Snapshot of the request properties discriminators can read
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub ip: Option<IpAddr>,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub scheme: Option<String>,
    pub headers: HeaderMap,
    /// Merged query and body parameters (always an object)
    pub params: Value,
}

impl RequestInfo {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            ip: None,
            method,
            path: path.into(),
            query: None,
            scheme: None,
            headers: HeaderMap::new(),
            params: Value::Object(Default::default()),
        }
    }

    /// Build from request parts
    ///
    /// Parameters start empty; call [`RequestInfo::decode_query`] when a
    /// param discriminator needs them.
    pub fn from_parts(parts: &Parts, ip: Option<IpAddr>) -> Self {
        Self {
            ip,
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            scheme: parts.uri.scheme_str().map(str::to_string),
            headers: parts.headers.clone(),
            params: Value::Object(Default::default()),
        }
    }

    /// Merge the decoded query string into `params`
    pub fn decode_query(&mut self) {
        if let Some(query) = self.query.as_deref() {
            let decoded = crate::params::parse_urlencoded(query.as_bytes());
            crate::params::merge(&mut self.params, decoded);
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.params = crate::params::parse_urlencoded(query.as_bytes());
        self.query = Some(query.to_string());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        crate::params::merge(&mut self.params, params);
        self
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn host(&self) -> Option<&str> {
        self.header(&header::HOST)
    }

    /// Read an attribute as a string
    pub fn attribute(&self, attribute: &RequestAttribute) -> Option<String> {
        match attribute {
            RequestAttribute::Ip => self.ip.map(|ip| ip.to_string()),
            RequestAttribute::Path => Some(self.path.clone()),
            RequestAttribute::Method => Some(self.method.to_string()),
            RequestAttribute::Host => self.host().map(str::to_string),
            RequestAttribute::UserAgent => self.header(&header::USER_AGENT).map(str::to_string),
            RequestAttribute::Referer => self.header(&header::REFERER).map(str::to_string),
            RequestAttribute::QueryString => self.query.clone(),
            RequestAttribute::Scheme => self.scheme.clone(),
            RequestAttribute::Header(name) => self.header(name).map(str::to_string),
        }
    }
}

/// Where a throttle reads its bucketing value from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    Attribute(RequestAttribute),
    Param(ParamPath),
}

impl Discriminator {
    pub fn attribute(property: &str) -> Result<Self> {
        property.parse().map(Self::Attribute)
    }

    pub fn param(path: ParamPath) -> Self {
        Self::Param(path)
    }

    /// Whether resolving this discriminator may need the request body
    pub fn reads_params(&self) -> bool {
        matches!(self, Self::Param(_))
    }

    /// Resolve the bucketing value; empty and non-scalar values count as missing
    pub fn resolve(&self, request: &RequestInfo) -> Option<String> {
        let value = match self {
            Self::Attribute(attribute) => request.attribute(attribute),
            Self::Param(path) => path.dig(&request.params).and_then(scalar_to_string),
        }?;

        if value.is_empty() { None } else { Some(value) }
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attribute(attribute) => write!(f, "{}", attribute),
            Self::Param(path) => write!(f, "params.{}", path),
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
