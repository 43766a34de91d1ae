//! Session defaults.

use crate::tls::TlsBufferStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration applied by the reactor to new sessions
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of per-exchange output buffers in bytes
    pub buffer_size: usize,
    /// Idle timeout for sessions without one, `0s` disables it
    #[serde(with = "duration_str")]
    pub socket_timeout: Duration,
    /// Poll interval of the reactor loop
    #[serde(with = "duration_str")]
    pub select_interval: Duration,
    /// Scratch buffer policy for TLS layers
    pub tls_buffer_strategy: TlsBufferStrategy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            socket_timeout: Duration::from_secs(30),
            select_interval: Duration::from_millis(1000),
            tls_buffer_strategy: TlsBufferStrategy::Static,
        }
    }
}

/// Durations written as human-readable strings, e.g. `30s` or `250ms`
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_size, 8192);
        assert_eq!(config.socket_timeout, Duration::from_secs(30));
        assert_eq!(config.tls_buffer_strategy, TlsBufferStrategy::Static);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
socket_timeout: 5s
select_interval: 250ms
tls_buffer_strategy: dynamic
"#;
        let config: SessionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.socket_timeout, Duration::from_secs(5));
        assert_eq!(config.select_interval, Duration::from_millis(250));
        assert_eq!(config.tls_buffer_strategy, TlsBufferStrategy::Dynamic);
        assert_eq!(config.buffer_size, 8192);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let result: Result<SessionConfig, _> = serde_yaml::from_str("socket_timeout: soon");
        assert!(result.is_err());
    }
}
