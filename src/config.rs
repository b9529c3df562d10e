use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::discriminator::{Discriminator, ParamPath};
use crate::error::{Result, ThrottleError};
use crate::paths::ProtectedPaths;
use crate::safelist::Safelist;
use crate::utils::get_env_with_prefix;

/// Config file read when no override is set
pub const DEFAULT_CONFIG_PATH: &str = "config/throttle.yml";

/// Throttle configuration, usually loaded from YAML
///
/// ```yaml
/// enabled: true
/// cache:
///   class: memory
///   named_params:
///     max_entries: 50000
/// discriminators:
///   ip: ip
/// params_discriminators:
///   email: user.email
/// limit: 5
/// period: 60
/// protected_paths:
///   - path: /users/sign_in
///     methods: [POST]
/// trusted_ips: [127.0.0.1]
/// tracks_log_level: warn
/// safelist_log_level: debug
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThrottleConfig {
    /// Whether throttling is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Counter store selection
    #[serde(default, deserialize_with = "null_as_default")]
    pub cache: CacheConfig,

    /// Throttle name -> request property path (`ip`, `header.x-api-key`, ...)
    #[serde(default, deserialize_with = "null_as_default")]
    pub discriminators: BTreeMap<String, String>,

    /// Throttle name -> request parameter path (`user.email`)
    #[serde(default, deserialize_with = "null_as_default")]
    pub params_discriminators: BTreeMap<String, ParamPath>,

    /// Maximum requests per period for each throttle and discriminator value
    #[serde(default)]
    pub limit: u32,

    /// Period length in seconds
    #[serde(default)]
    pub period: u64,

    /// Prefix joined onto every protected path (e.g. an app mounted under `/app`)
    #[serde(default, deserialize_with = "null_as_default")]
    pub path_prefix: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub protected_paths: Vec<ProtectedPathConfig>,

    /// Safelisted client IPs or CIDR blocks
    #[serde(default, deserialize_with = "null_as_default")]
    pub trusted_ips: Vec<String>,

    /// Log level for throttle matches; no logging when unset
    #[serde(default)]
    pub tracks_log_level: Option<LogLevel>,

    /// Log level for safelist hits; no logging when unset
    #[serde(default)]
    pub safelist_log_level: Option<LogLevel>,
}

/// Counter store selection and its constructor arguments
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Store class: `memory`, `redis`, `governor` or `null`
    #[serde(default = "default_cache_class")]
    pub class: String,

    /// Positional arguments (e.g. the Redis URL)
    #[serde(default, deserialize_with = "null_as_default")]
    pub params: Vec<serde_yaml::Value>,

    /// Named arguments (e.g. `max_entries`, `namespace`)
    #[serde(default, deserialize_with = "null_as_default")]
    pub named_params: BTreeMap<String, serde_yaml::Value>,
}

/// A protected path entry; a bare string means "any method"
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "RawProtectedPath")]
pub struct ProtectedPathConfig {
    pub path: String,
    pub methods: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProtectedPath {
    Path(String),
    Full {
        path: String,
        #[serde(default, deserialize_with = "null_as_default")]
        methods: Vec<String>,
    },
}

impl From<RawProtectedPath> for ProtectedPathConfig {
    fn from(raw: RawProtectedPath) -> Self {
        match raw {
            RawProtectedPath::Path(path) => Self {
                path,
                methods: Vec::new(),
            },
            RawProtectedPath::Full { path, methods } => Self { path, methods },
        }
    }
}

impl ProtectedPathConfig {
    pub fn new(path: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            path: path.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// Log level for throttle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(ThrottleError::config(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                other
            ))),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache: CacheConfig::default(),
            discriminators: BTreeMap::new(),
            params_discriminators: BTreeMap::new(),
            limit: 0,
            period: 0,
            path_prefix: String::new(),
            protected_paths: Vec::new(),
            trusted_ips: Vec::new(),
            tracks_log_level: None,
            safelist_log_level: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            class: default_cache_class(),
            params: Vec::new(),
            named_params: BTreeMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, value: impl Into<serde_yaml::Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn with_named_param(mut self, key: impl Into<String>, value: impl Into<serde_yaml::Value>) -> Self {
        self.named_params.insert(key.into(), value.into());
        self
    }

    /// Positional string argument
    pub fn param_str(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(|v| v.as_str())
    }

    /// Named string argument
    pub fn named_str(&self, key: &str) -> Option<&str> {
        self.named_params.get(key).and_then(|v| v.as_str())
    }

    /// Named integer argument; strings holding digits are accepted too
    pub fn named_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.named_params.get(key) {
            None | Some(serde_yaml::Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                .map(Some)
                .ok_or_else(|| {
                    ThrottleError::config(format!(
                        "cache.named_params.{} must be a non-negative integer",
                        key
                    ))
                }),
        }
    }
}

impl ThrottleConfig {
    /// Create a new ThrottleConfig builder
    pub fn builder() -> ThrottleConfigBuilder {
        ThrottleConfigBuilder::new()
    }

    /// Parse a YAML document; missing keys fall back to empty defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Option<Self> = serde_yaml::from_str(yaml)?;
        Ok(config.unwrap_or_default())
    }

    /// Read and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ThrottleError::io(path, e))?;
        Self::from_yaml_str(&contents)
    }

    /// Config file location: `TIDEWAY_THROTTLE_CONFIG_FILE` / `THROTTLE_CONFIG_FILE`,
    /// else [`DEFAULT_CONFIG_PATH`]
    pub fn config_path() -> PathBuf {
        config_override()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the config file selected by [`ThrottleConfig::config_path`]
    ///
    /// A missing file is an error when the path came from the environment.
    /// A missing default file yields a disabled config.
    pub fn load() -> Result<Self> {
        Self::load_from(config_override())
    }

    fn load_from(override_path: Option<String>) -> Result<Self> {
        match override_path {
            Some(path) => {
                tracing::debug!(path = %path, "Loading throttle config from override");
                Self::from_file(path)
            }
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    tracing::info!(
                        path = DEFAULT_CONFIG_PATH,
                        "No throttle config found, throttling disabled"
                    );
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load throttle settings from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `THROTTLE_*` environment overrides on top of this config
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(enabled) = get_env_with_prefix("THROTTLE_ENABLED") {
            self.enabled = enabled.parse().unwrap_or(self.enabled);
        }

        if let Some(limit) = get_env_with_prefix("THROTTLE_LIMIT") {
            if let Ok(val) = limit.parse() {
                self.limit = val;
            }
        }

        if let Some(period) = get_env_with_prefix("THROTTLE_PERIOD") {
            if let Ok(val) = period.parse() {
                self.period = val;
            }
        }

        if let Some(prefix) = get_env_with_prefix("THROTTLE_PATH_PREFIX") {
            self.path_prefix = prefix;
        }

        self
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    /// Protected paths with the prefix applied and methods parsed
    pub fn protected_paths(&self) -> Result<ProtectedPaths> {
        ProtectedPaths::new(&self.path_prefix, &self.protected_paths)
    }

    pub fn safelist(&self) -> Result<Safelist> {
        Safelist::new(self.trusted_ips.as_slice())
    }

    /// All configured throttles as (name, discriminator), attribute ones first
    pub fn throttle_discriminators(&self) -> Result<Vec<(String, Discriminator)>> {
        let mut throttles = Vec::with_capacity(
            self.discriminators.len() + self.params_discriminators.len(),
        );

        for name in self.discriminators.keys().chain(self.params_discriminators.keys()) {
            if name.is_empty() || name.contains(':') {
                return Err(ThrottleError::config(format!(
                    "throttle name {:?} must be non-empty and contain no ':'",
                    name
                )));
            }
        }

        for (name, property) in &self.discriminators {
            let discriminator = Discriminator::attribute(property).map_err(|e| {
                ThrottleError::config(format!("discriminators.{}: {}", name, e))
            })?;
            throttles.push((name.clone(), discriminator));
        }

        for (name, path) in &self.params_discriminators {
            throttles.push((name.clone(), Discriminator::param(path.clone())));
        }

        Ok(throttles)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if throttling is enabled and:
    /// - `limit` or `period` is 0
    /// - the governor store would get a per-request interval of zero
    /// - a protected path is empty or lists an invalid HTTP method
    /// - a discriminator names an unknown request property, or a throttle
    ///   name is empty or contains `:`
    /// - a trusted IP is not an address or CIDR block
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.limit == 0 {
            return Err(ThrottleError::config(
                "limit must be greater than 0 when throttling is enabled",
            ));
        }

        if self.period == 0 {
            return Err(ThrottleError::config(
                "period must be greater than 0 when throttling is enabled",
            ));
        }

        if self.cache.class.trim().is_empty() {
            return Err(ThrottleError::config("cache.class must not be empty"));
        }

        if crate::store::normalize_class(&self.cache.class) == "governor"
            && self.period_duration() / self.limit == Duration::ZERO
        {
            return Err(ThrottleError::config(format!(
                "governor store cannot spread {} requests over {} seconds",
                self.limit, self.period
            )));
        }

        self.protected_paths()?;
        self.throttle_discriminators()?;
        self.safelist()?;

        Ok(())
    }
}

/// Builder for ThrottleConfig
#[must_use = "builder does nothing until you call build()"]
pub struct ThrottleConfigBuilder {
    config: ThrottleConfig,
}

impl ThrottleConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ThrottleConfig::default(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.config.limit = limit;
        self
    }

    pub fn period(mut self, seconds: u64) -> Self {
        self.config.period = seconds;
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.path_prefix = prefix.into();
        self
    }

    /// Protect a path for the given methods (empty slice = every method)
    pub fn protect(mut self, path: impl Into<String>, methods: &[&str]) -> Self {
        self.config
            .protected_paths
            .push(ProtectedPathConfig::new(path, methods));
        self
    }

    /// Throttle by a request property such as `ip` or `header.x-api-key`
    pub fn discriminator(mut self, name: impl Into<String>, property: impl Into<String>) -> Self {
        self.config
            .discriminators
            .insert(name.into(), property.into());
        self
    }

    /// Throttle by a request parameter path
    pub fn params_discriminator(mut self, name: impl Into<String>, path: ParamPath) -> Self {
        self.config
            .params_discriminators
            .insert(name.into(), path);
        self
    }

    pub fn trusted_ip(mut self, ip: impl Into<String>) -> Self {
        self.config.trusted_ips.push(ip.into());
        self
    }

    pub fn tracks_log_level(mut self, level: LogLevel) -> Self {
        self.config.tracks_log_level = Some(level);
        self
    }

    pub fn safelist_log_level(mut self, level: LogLevel) -> Self {
        self.config.safelist_log_level = Some(level);
        self
    }

    /// Build the configuration, validating all settings
    pub fn build(self) -> Result<ThrottleConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ThrottleConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn config_override() -> Option<String> {
    get_env_with_prefix("THROTTLE_CONFIG_FILE").filter(|p| !p.trim().is_empty())
}

fn default_cache_class() -> String {
    "memory".to_string()
}

/// Treat an explicit YAML `null` like a missing key
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}
