//! Request parameter decoding.
//!
//! Query strings and form bodies use bracket notation for nesting
//! (`user[email]=a@b.c`, `ids[]=1&ids[]=2`). Everything decodes into a
//! `serde_json::Value` object so param discriminators can walk one tree no
//! matter where a value came from.

use serde_json::{Map, Value};

/// Maximum request body size read for param discriminators (64 KiB)
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Deepest bracket nesting decoded; anything below stays one literal segment
pub const MAX_KEY_DEPTH: usize = 32;

/// Body encodings that carry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Form,
    Json,
}

impl BodyKind {
    /// Detect the body kind from a `Content-Type` header value
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if mime == "application/x-www-form-urlencoded" {
            Some(Self::Form)
        } else if mime == "application/json" || mime.ends_with("+json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

/// Decode a urlencoded string into a nested parameter object
pub fn parse_urlencoded(input: &[u8]) -> Value {
    let mut root = Value::Object(Map::new());
    for (key, value) in url::form_urlencoded::parse(input) {
        if key.is_empty() {
            continue;
        }
        let segments = split_key(&key);
        insert(&mut root, &segments, value.into_owned());
    }
    root
}

/// Decode a request body of the given kind
///
/// Malformed bodies and non-object JSON decode to `None`.
pub fn parse_body(kind: BodyKind, body: &[u8]) -> Option<Value> {
    match kind {
        BodyKind::Form => Some(parse_urlencoded(body)),
        BodyKind::Json => match serde_json::from_slice::<Value>(body) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        },
    }
}

/// Merge `source` into `target`; keys in `source` win
pub fn merge(target: &mut Value, source: Value) {
    let Value::Object(incoming) = source else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in incoming {
            map.insert(key, value);
        }
    }
}

/// Split `user[address][city]` into `["user", "address", "city"]`
///
/// `ids[]` yields a trailing empty segment, meaning "append". Keys with an
/// unbalanced bracket are kept as a single literal segment. Past
/// [`MAX_KEY_DEPTH`] segments the rest of the key is one literal segment.
fn split_key(key: &str) -> Vec<&str> {
    let Some(open) = key.find('[') else {
        return vec![key];
    };
    if open == 0 {
        return vec![key];
    }

    let mut segments = vec![&key[..open]];
    let mut rest = &key[open..];
    while let Some(inner) = rest.strip_prefix('[') {
        if segments.len() == MAX_KEY_DEPTH {
            segments.push(rest);
            break;
        }
        match inner.find(']') {
            Some(close) => {
                segments.push(&inner[..close]);
                rest = &inner[close + 1..];
            }
            None => return vec![key],
        }
    }
    segments
}

fn insert(node: &mut Value, segments: &[&str], leaf: String) {
    let Some((first, rest)) = segments.split_first() else {
        *node = Value::String(leaf);
        return;
    };

    if first.is_empty() {
        if !node.is_array() {
            *node = Value::Array(Vec::new());
        }
        if let Value::Array(items) = node {
            let mut child = Value::Null;
            insert(&mut child, rest, leaf);
            items.push(child);
        }
        return;
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        insert(child, rest, leaf);
    }
}
