//! Registry configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the service registry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Namespace scoping every registry key, `<prefix>/<type>/<id>`
    pub prefix: String,
    /// Timeout applied to each coordination store call, in milliseconds
    pub dial_timeout_ms: u64,
    /// Virtual nodes per member on every consistent-hash ring
    pub replicas: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: "server".to_string(),
            dial_timeout_ms: 5_000,
            replicas: 20,
        }
    }
}

impl RegistryConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Key prefix in its normalized `/<prefix>/` form
    pub fn key_prefix(&self) -> String {
        format!("/{}/", self.prefix.trim_matches('/'))
    }
}

/// Configuration for the sticky selection cache
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Maximum number of routing arguments remembered
    pub capacity: usize,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.prefix, "server");
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.replicas, 20);
        assert_eq!(FinderConfig::default().capacity, 10_000);
    }

    #[test]
    fn test_key_prefix_is_normalized() {
        assert_eq!(RegistryConfig::default().key_prefix(), "/server/");
        let config = RegistryConfig::default().with_prefix("/mesh/");
        assert_eq!(config.key_prefix(), "/mesh/");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RegistryConfig = serde_json::from_str(r#"{"prefix":"games"}"#).unwrap();
        assert_eq!(config.prefix, "games");
        assert_eq!(config.replicas, 20);
    }
}
