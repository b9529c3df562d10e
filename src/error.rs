/// The main error type for throttle configuration and counter stores
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    #[error("Invalid throttle configuration: {0}")]
    Config(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Counter store error: {0}")]
    Store(String),
}

impl ThrottleError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Whether the error came from a misconfiguration rather than a runtime failure
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Yaml(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for ThrottleError {
    fn from(err: redis::RedisError) -> Self {
        ThrottleError::Store(format!("Redis error: {}", err))
    }
}

/// Result type alias for throttle operations
pub type Result<T> = std::result::Result<T, ThrottleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ThrottleError::config("limit must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Invalid throttle configuration: limit must be greater than 0"
        );
        assert!(err.is_config());
    }

    #[test]
    fn test_io_error_keeps_path() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ThrottleError::io("config/throttle.yml", source);
        assert!(err.to_string().contains("config/throttle.yml"));
        assert!(!err.is_config());
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_err = serde_yaml::from_str::<u32>("[not, a, number]").unwrap_err();
        let err: ThrottleError = yaml_err.into();
        assert!(matches!(err, ThrottleError::Yaml(_)));
        assert!(err.is_config());
    }
}
