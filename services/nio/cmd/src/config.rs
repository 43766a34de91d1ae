//! Configuration handling for the nio pump.
//!
//! Values come from the YAML config file first, then `NIO_*` environment
//! variables, then command line flags.

use anyhow::Result;
use nio_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Pump demo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Session defaults handed to the registry
    pub session: SessionConfig,
    /// Total bytes produced
    pub payload_bytes: usize,
    /// Size of each producer write
    pub chunk_size: usize,
    /// Bytes the simulated peer accepts per reactor cycle
    pub sink_window: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        // The peer opens a fresh window every cycle, so poll often
        let session = SessionConfig {
            select_interval: Duration::from_millis(1),
            ..SessionConfig::default()
        };
        Self {
            session,
            payload_bytes: 256 * 1024,
            chunk_size: 1500,
            sink_window: 4096,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    nio: Option<PumpConfig>,
}

impl PumpConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    if let Some(nio) = root.services.and_then(|s| s.nio) {
                        config = nio;
                    }
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(
            "Final pump configuration: payload={}B chunk={}B window={}B buffer={}B timeout={:?} interval={:?}",
            config.payload_bytes,
            config.chunk_size,
            config.sink_window,
            config.session.buffer_size,
            config.session.socket_timeout,
            config.session.select_interval
        );
        Ok(config)
    }

    /// Apply `NIO_*` overrides from `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|v| v.parse::<usize>().ok());
        let duration = |key: &str| lookup(key).and_then(|v| humantime::parse_duration(&v).ok());

        if let Some(v) = number("NIO_PAYLOAD_BYTES") {
            self.payload_bytes = v;
            info!("Payload size overridden by environment: {}", v);
        }
        if let Some(v) = number("NIO_CHUNK_SIZE") {
            self.chunk_size = v;
            info!("Chunk size overridden by environment: {}", v);
        }
        if let Some(v) = number("NIO_SINK_WINDOW") {
            self.sink_window = v;
            info!("Sink window overridden by environment: {}", v);
        }
        if let Some(v) = number("NIO_BUFFER_SIZE") {
            self.session.buffer_size = v;
            info!("Buffer size overridden by environment: {}", v);
        }
        if let Some(v) = duration("NIO_SOCKET_TIMEOUT") {
            self.session.socket_timeout = v;
            info!("Socket timeout overridden by environment: {:?}", v);
        }
        if let Some(v) = duration("NIO_SELECT_INTERVAL") {
            self.session.select_interval = v;
            info!("Select interval overridden by environment: {:?}", v);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.session.buffer_size == 0 {
            anyhow::bail!("buffer_size must be positive");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        if self.sink_window == 0 {
            anyhow::bail!("sink_window must be positive, the pump would never finish");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nio_session::TlsBufferStrategy;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = PumpConfig::default();
        assert_eq!(config.payload_bytes, 256 * 1024);
        assert_eq!(config.chunk_size, 1500);
        assert_eq!(config.session.buffer_size, 8192);
        assert_eq!(config.session.select_interval, Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  nio:
    payload_bytes: 10000
    sink_window: 512
    session:
      buffer_size: 2048
      socket_timeout: 2s
      select_interval: 5ms
      tls_buffer_strategy: dynamic
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = PumpConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.payload_bytes, 10000);
        assert_eq!(config.sink_window, 512);
        assert_eq!(config.chunk_size, 1500);
        assert_eq!(config.session.buffer_size, 2048);
        assert_eq!(config.session.socket_timeout, Duration::from_secs(2));
        assert_eq!(config.session.select_interval, Duration::from_millis(5));
        assert_eq!(config.session.tls_buffer_strategy, TlsBufferStrategy::Dynamic);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = PumpConfig::load_from_file("/nonexistent/nio.yaml").unwrap();
        assert_eq!(config.sink_window, PumpConfig::default().sink_window);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("NIO_CHUNK_SIZE", "64"),
            ("NIO_SOCKET_TIMEOUT", "250ms"),
            ("NIO_SELECT_INTERVAL", "20ms"),
            ("NIO_SINK_WINDOW", "not a number"),
        ]
        .into_iter()
        .collect();

        let mut config = PumpConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.chunk_size, 64);
        assert_eq!(config.session.socket_timeout, Duration::from_millis(250));
        assert_eq!(config.session.select_interval, Duration::from_millis(20));
        assert_eq!(config.sink_window, 4096);
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = PumpConfig {
            sink_window: 0,
            ..PumpConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
