//! Broker configuration

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_initialize_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_idle_cleanup_delay_ms() -> u64 {
    60_000
}

/// Broker-wide tuning knobs plus the per-language initialization options bag.
///
/// The options bag is opaque to the broker; it is forwarded verbatim as
/// `initializationOptions` in the initialize handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Timeout for correlated requests (ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for the initialize handshake (ms)
    #[serde(default = "default_initialize_timeout_ms")]
    pub initialize_timeout_ms: u64,

    /// Timeout for the graceful shutdown request (ms)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Delay before an unreferenced session is torn down (ms)
    #[serde(default = "default_idle_cleanup_delay_ms")]
    pub idle_cleanup_delay_ms: u64,

    /// Language tag -> opaque initialization options
    #[serde(default)]
    pub initialization_options: HashMap<String, Value>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            initialize_timeout_ms: default_initialize_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            idle_cleanup_delay_ms: default_idle_cleanup_delay_ms(),
            initialization_options: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn idle_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.idle_cleanup_delay_ms)
    }

    /// Options bag for one language, if configured.
    pub fn initialization_options_for(&self, language: &str) -> Option<&Value> {
        self.initialization_options.get(language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_to_empty_input() {
        let config: BrokerConfig = serde_json::from_value(serde_json::json!({}))
            .expect("empty object should deserialize");
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_input_keeps_remaining_defaults() {
        let config: BrokerConfig = serde_json::from_value(serde_json::json!({
            "request_timeout_ms": 5_000,
            "initialization_options": { "go": { "usePlaceholders": true } },
        }))
        .expect("partial object should deserialize");
        assert_eq!(config.request_timeout_ms, 5_000);
        assert_eq!(config.shutdown_timeout_ms, default_shutdown_timeout_ms());
        assert_eq!(
            config.initialization_options_for("go"),
            Some(&serde_json::json!({ "usePlaceholders": true }))
        );
        assert_eq!(config.initialization_options_for("rust"), None);
    }
}
