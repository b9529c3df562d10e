/// Get environment variable with TIDEWAY_ prefix, falling back to unprefixed version
///
/// Checks `TIDEWAY_{key}` first, then `{key}`, so platform-level variables
/// such as `TRUSTED_PROXIES` keep working next to namespaced ones.
///
/// # Examples
///
/// ```rust
/// use tideway_throttle::utils::get_env_with_prefix;
///
/// // Checks TIDEWAY_THROTTLE_CONFIG_FILE first, then THROTTLE_CONFIG_FILE
/// let path = get_env_with_prefix("THROTTLE_CONFIG_FILE");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TIDEWAY_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Read a comma-separated list from the environment
///
/// Entries are trimmed and blanks dropped. Returns an empty list when the
/// variable is unset.
pub fn get_env_list(key: &str) -> Vec<String> {
    get_env_with_prefix(key)
        .map(|value| split_list(&value))
        .unwrap_or_default()
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
