//! Configuration handling for the bridge binary.
//!
//! This module reads the YAML configuration file and environment variables,
//! producing the fleet configuration and the list of controllers to register.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spcore_session::{ControllerConfig, FleetConfig, SessionTimings};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Bridge configuration (matches the YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Listener, TLS and takeover settings
    pub fleet: FleetConfig,
    /// Controllers to register at startup
    pub controllers: Vec<ControllerConfig>,
    /// Session timing overrides
    pub timings: TimingsConfig,
}

/// Session timings as humantime strings, e.g. `"1s"` or `"250ms"`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub ping_interval: Option<String>,
    pub retry_interval: Option<String>,
    pub offline_after: Option<String>,
    pub connect_timeout: Option<String>,
    pub idle_timeout: Option<String>,
    pub write_timeout: Option<String>,
    pub stop_timeout: Option<String>,
    pub queue_capacity: Option<usize>,
}

impl TimingsConfig {
    /// Apply the configured values over the defaults
    pub fn resolve(&self) -> Result<SessionTimings> {
        let mut timings = SessionTimings::default();
        let fields = [
            ("ping_interval", &self.ping_interval, &mut timings.ping_interval),
            ("retry_interval", &self.retry_interval, &mut timings.retry_interval),
            ("offline_after", &self.offline_after, &mut timings.offline_after),
            ("connect_timeout", &self.connect_timeout, &mut timings.connect_timeout),
            ("idle_timeout", &self.idle_timeout, &mut timings.idle_timeout),
            ("write_timeout", &self.write_timeout, &mut timings.write_timeout),
            ("stop_timeout", &self.stop_timeout, &mut timings.stop_timeout),
        ];
        for (name, value, target) in fields {
            if let Some(value) = value {
                *target = parse_duration(value).with_context(|| format!("timings.{}", name))?;
            }
        }
        if let Some(capacity) = self.queue_capacity {
            timings.queue_capacity = capacity.max(1);
        }
        Ok(timings)
    }
}

fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("invalid duration '{}'", value))
}

impl BridgeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: BridgeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        config.fleet.timings = config.timings.resolve()?;

        info!(
            "Final bridge configuration: listen={}, controllers={}, tls={}",
            config
                .fleet
                .listen
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "disabled".to_string()),
            config.controllers.len(),
            config.fleet.tls.use_encryption
        );
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("SPCORE_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.fleet.listen = Some(addr);
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring SPCORE_LISTEN={}: {}", listen, e),
            }
        }

        if let Ok(host) = std::env::var("SPCORE_CALLBACK_HOST") {
            info!("Callback host overridden by environment: {}", host);
            self.fleet.callback_host = Some(host);
        }

        if let Ok(strict) = std::env::var("SPCORE_STRICT_IDENTITY") {
            self.fleet.strict_identity = matches!(strict.to_lowercase().as_str(), "1" | "true" | "yes");
            info!(
                "Strict identity overridden by environment: {}",
                self.fleet.strict_identity
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.fleet.listen.is_none());
        assert!(config.controllers.is_empty());
        assert_eq!(config.timings.resolve().unwrap(), SessionTimings::default());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
fleet:
  listen: 127.0.0.1:9731
  callback_host: bridge.local
  no_takeover: true
  tls:
    use_encryption: false
    enabled_protocols: [tls1.2, tls1.3]

controllers:
  - name: front-door
    address: 10.0.0.20
    port: 9730
    password: secret
  - name: loading-dock
    mac_address: AA:BB:CC:DD:EE:FF
    dials_out: false

timings:
  ping_interval: 2s
  idle_timeout: 45s
  queue_capacity: 16
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.fleet.listen, Some("127.0.0.1:9731".parse().unwrap()));
        assert_eq!(config.fleet.callback_host.as_deref(), Some("bridge.local"));
        assert!(config.fleet.no_takeover);
        assert_eq!(config.fleet.tls.enabled_protocols.len(), 2);

        assert_eq!(config.controllers.len(), 2);
        assert!(config.controllers[0].dials_out);
        assert_eq!(config.controllers[0].password.as_deref(), Some("secret"));
        assert!(!config.controllers[1].dials_out);
        assert_eq!(config.controllers[1].display_name(), "loading-dock");

        assert_eq!(config.fleet.timings.ping_interval, Duration::from_secs(2));
        assert_eq!(config.fleet.timings.idle_timeout, Duration::from_secs(45));
        assert_eq!(config.fleet.timings.queue_capacity, 16);
        assert_eq!(config.fleet.timings.retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_duration_is_an_error() {
        let timings = TimingsConfig {
            retry_interval: Some("soon".into()),
            ..Default::default()
        };
        let err = timings.resolve().unwrap_err();
        assert!(format!("{:#}", err).contains("timings.retry_interval"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert!(config.controllers.is_empty());
    }
}
