use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::{Result, SnifferError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureDefaults,
    pub strategies: StrategyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureDefaults {
    pub buffer_capacity: usize,
    pub default_timeout_secs: u64,
    pub default_packet_count: usize,
    pub promiscuous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub probe_timeout_ms: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub tshark_path: Option<String>,
    pub enable_native: bool,
    pub enable_tshark: bool,
    pub synthetic_fallback: bool,
    pub synthetic_packets: usize,
    pub synthetic_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            default_timeout_secs: 30,
            default_packet_count: 0,
            promiscuous: true,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 4000,
            batch_size: 5,
            batch_timeout_ms: 3000,
            stop_grace_ms: 2000,
            tshark_path: None,
            enable_native: true,
            enable_tshark: true,
            synthetic_fallback: true,
            synthetic_packets: 20,
            synthetic_seed: 0x5EED,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl StrategyConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.buffer_capacity == 0 {
            return Err(SnifferError::InvalidConfig(
                "capture.buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.capture.default_timeout_secs == 0 {
            return Err(SnifferError::InvalidConfig(
                "capture.default_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.strategies.batch_size == 0 {
            return Err(SnifferError::InvalidConfig(
                "strategies.batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters of one capture run. Field names follow the start request
/// accepted by the dashboard (`packet_count`, `timeout`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub packet_count: usize,
    #[serde(rename = "timeout", default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    CaptureDefaults::default().default_timeout_secs
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: None,
            filter: None,
            packet_count: 0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CaptureConfig {
    pub fn from_defaults(defaults: &CaptureDefaults) -> Self {
        Self {
            interface: None,
            filter: None,
            packet_count: defaults.default_packet_count,
            timeout_secs: defaults.default_timeout_secs,
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_packet_count(mut self, count: usize) -> Self {
        self.packet_count = count;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Requested interface, or `None` when automatic selection applies.
    pub fn requested_interface(&self) -> Option<&str> {
        match self.interface.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) if name.eq_ignore_ascii_case("any") || name.eq_ignore_ascii_case("auto") => None,
            Some(name) => Some(name),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(SnifferError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_deserialization() {
        let request: CaptureConfig = serde_json::from_str(
            r#"{"interface": "Wi-Fi", "filter": "tcp port 80", "packet_count": 50, "timeout": 10}"#,
        )
        .unwrap();
        assert_eq!(request.interface.as_deref(), Some("Wi-Fi"));
        assert_eq!(request.packet_count, 50);
        assert_eq!(request.timeout_secs, 10);

        let minimal: CaptureConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(minimal.packet_count, 0);
        assert_eq!(minimal.timeout_secs, 30);
        assert!(minimal.requested_interface().is_none());
    }

    #[test]
    fn test_any_interface_means_automatic() {
        let config = CaptureConfig::default().with_interface("any");
        assert!(config.requested_interface().is_none());
        let config = CaptureConfig::default().with_interface("eth0");
        assert_eq!(config.requested_interface(), Some("eth0"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = CaptureConfig::default().with_timeout_secs(0);
        assert!(matches!(config.validate(), Err(SnifferError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netsniff.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.capture.buffer_capacity = 250;
        config.strategies.enable_tshark = false;
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.capture.buffer_capacity, 250);
        assert!(!loaded.strategies.enable_tshark);
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"capture": {"buffer_capacity": 10}}"#).unwrap();
        assert_eq!(config.capture.buffer_capacity, 10);
        assert_eq!(config.capture.default_timeout_secs, 30);
        assert_eq!(config.strategies.batch_size, 5);
    }
}
