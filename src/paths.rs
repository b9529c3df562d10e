//! Protected path matching.

use crate::config::ProtectedPathConfig;
use crate::error::{Result, ThrottleError};
use axum::http::Method;

/// One protected path with the methods it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPath {
    pub path: String,
    /// Empty means every method
    pub methods: Vec<Method>,
}

impl ProtectedPath {
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.path == path && (self.methods.is_empty() || self.methods.contains(method))
    }
}

/// The full set of protected paths, prefixed and normalized
#[derive(Debug, Clone, Default)]
pub struct ProtectedPaths {
    paths: Vec<ProtectedPath>,
}

impl ProtectedPaths {
    pub fn new(prefix: &str, configs: &[ProtectedPathConfig]) -> Result<Self> {
        let paths = configs
            .iter()
            .map(|config| {
                if config.path.trim().is_empty() {
                    return Err(ThrottleError::config("Protected path must not be empty"));
                }
                let methods = config
                    .methods
                    .iter()
                    .map(|m| parse_method(m))
                    .collect::<Result<Vec<_>>>()?;
                Ok(ProtectedPath {
                    path: join_prefix(prefix, &config.path),
                    methods,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { paths })
    }

    /// Whether the request path and method hit a protected path
    pub fn is_protected(&self, method: &Method, path: &str) -> bool {
        if self.paths.is_empty() {
            return false;
        }
        let path = normalize_path(path);
        self.paths.iter().any(|p| p.matches(method, &path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtectedPath> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// One leading slash, no empty segments, no trailing slash (except root)
pub fn normalize_path(path: &str) -> String {
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}

pub fn join_prefix(prefix: &str, path: &str) -> String {
    normalize_path(&format!("{}/{}", prefix, path))
}

pub(crate) fn parse_method(method: &str) -> Result<Method> {
    let upper = method.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return Err(ThrottleError::config("HTTP method must not be empty"));
    }
    Method::from_bytes(upper.as_bytes())
        .map_err(|_| ThrottleError::config(format!("Invalid HTTP method: {}", method)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: &str, methods: &[&str]) -> ProtectedPathConfig {
        ProtectedPathConfig {
            path: path.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("users/sign_in"), "/users/sign_in");
        assert_eq!(normalize_path("//users///sign_in/"), "/users/sign_in");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_prefix_is_applied() {
        let paths = ProtectedPaths::new("/app/", &[config("/users/sign_in", &["post"])]).unwrap();
        let first = paths.iter().next().unwrap();
        assert_eq!(first.path, "/app/users/sign_in");
        assert_eq!(first.methods, vec![Method::POST]);

        let paths = ProtectedPaths::new("", &[config("login", &[])]).unwrap();
        assert_eq!(paths.iter().next().unwrap().path, "/login");
    }

    #[test]
    fn test_is_protected_checks_method_and_path() {
        let paths = ProtectedPaths::new(
            "/app",
            &[config("/users/sign_in", &["POST"]), config("/password", &["post", "put"])],
        )
        .unwrap();

        assert!(paths.is_protected(&Method::POST, "/app/users/sign_in"));
        assert!(paths.is_protected(&Method::POST, "/app/users/sign_in/"));
        assert!(paths.is_protected(&Method::PUT, "/app/password"));
        assert!(!paths.is_protected(&Method::GET, "/app/users/sign_in"));
        assert!(!paths.is_protected(&Method::POST, "/users/sign_in"));
        assert!(!paths.is_protected(&Method::POST, "/app/users/sign_in/extra"));
    }

    #[test]
    fn test_empty_methods_match_everything() {
        let paths = ProtectedPaths::new("", &[config("/api/otp", &[])]).unwrap();
        assert!(paths.is_protected(&Method::GET, "/api/otp"));
        assert!(paths.is_protected(&Method::DELETE, "/api/otp"));
    }

    #[test]
    fn test_invalid_entries_rejected() {
        assert!(ProtectedPaths::new("", &[config("  ", &["POST"])]).is_err());
        assert!(ProtectedPaths::new("", &[config("/x", &["PO ST"])]).is_err());
        assert!(ProtectedPaths::new("", &[config("/x", &[""])]).is_err());
    }
}
