//! RPC transport configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker paradigm backing the transport
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseType {
    /// Broker with native request/reply
    #[default]
    Native,
    /// Fire-and-forget queue broker, replies correlated by the transport
    Queue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub use_type: UseType,

    /// First segment of every subject
    pub prefix: String,

    /// Bound on broker calls; correlated requests wait twice this long
    pub dial_timeout_ms: u64,

    /// Log every inbound and outbound message at debug level
    pub debug_msg: bool,

    /// Channels kept by the queue backend's pool
    pub pool_size: usize,

    /// Reconnect-and-retry attempts after a failed channel acquisition
    pub reconnect_retries: u32,

    /// How often reply queues drop entries whose caller gave up
    pub reply_sweep_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            use_type: UseType::Native,
            prefix: "Rpc".to_string(),
            dial_timeout_ms: 5_000,
            debug_msg: false,
            pool_size: 10,
            reconnect_retries: 1,
            reply_sweep_interval_ms: 30_000,
        }
    }
}

impl RpcConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn reply_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.reply_sweep_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RpcConfig::default();
        assert_eq!(config.use_type, UseType::Native);
        assert_eq!(config.prefix, "Rpc");
        assert_eq!(config.dial_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.reconnect_retries, 1);
        assert_eq!(config.reply_sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_use_type_from_json() {
        let config: RpcConfig = serde_json::from_str(r#"{"use_type":"queue","pool_size":4}"#).unwrap();
        assert_eq!(config.use_type, UseType::Queue);
        assert_eq!(config.pool_size, 4);
        assert!(!config.debug_msg);
    }
}
