//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     two inputs configure the gateway:
//!     - the device config (cli argument): platform credentials. required,
//!       a broken or missing file stops startup.
//!     - `gateway.toml`: intervals, paths, logging. optional, every field
//!       has a default.
//!
//! structure:
//!     - DeviceConfig: deviceKey / devicePassword / platformHost
//!     - StoreConfig: persistence file path and removal behaviour
//!     - SamplingConfig: intervals, thermal window, interface keying, sensor path
//!     - LoggingConfig: level, log directory, ansi console
//!     - PlatformConfig: request timeout for calls to the platform
//!     - ControlConfig: feed endpoint listen address
//!
//! ==============================================================================

use crate::error::ConfigError;
use crate::sampler::{InterfaceKeying, DEFAULT_THERMAL_PATH};
use crate::store::{RemovalMode, DEFAULT_STORE_PATH};

use serde::Deserialize;
use std::path::{Path, PathBuf};

// ==============================================================================
// device credentials
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub device_key: String,
    pub device_password: String,
    pub platform_host: String,
}

impl DeviceConfig {
    /// Load the device config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Missing { path: path.to_path_buf(), source })?;
        Self::parse(&content, path)
    }

    /// json object, json array of three strings, or three plain lines
    /// (key, password, host)
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let malformed =
            |reason: String| ConfigError::Malformed { path: path.to_path_buf(), reason };

        let trimmed = content.trim_start();
        let config = if trimmed.starts_with('{') {
            serde_json::from_str::<DeviceConfig>(trimmed).map_err(|e| malformed(e.to_string()))?
        } else if trimmed.starts_with('[') {
            let values: Vec<String> =
                serde_json::from_str(trimmed).map_err(|e| malformed(e.to_string()))?;
            Self::from_positional(values).map_err(malformed)?
        } else {
            let lines = content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            Self::from_positional(lines).map_err(malformed)?
        };

        for (field, value) in [
            ("deviceKey", &config.device_key),
            ("devicePassword", &config.device_password),
            ("platformHost", &config.platform_host),
        ] {
            if value.trim().is_empty() {
                return Err(malformed(format!("field {} is empty", field)));
            }
        }
        Ok(config)
    }

    fn from_positional(values: Vec<String>) -> Result<Self, String> {
        let found = values.len();
        let mut values = values.into_iter();
        match (values.next(), values.next(), values.next()) {
            (Some(device_key), Some(device_password), Some(platform_host)) => {
                Ok(Self { device_key, device_password, platform_host })
            }
            _ => Err(format!(
                "expected device key, password and platform host, found {} value(s)",
                found
            )),
        }
    }
}

// ==============================================================================
// gateway settings (gateway.toml)
// ==============================================================================

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub store: StoreConfig,
    pub sampling: SamplingConfig,
    pub logging: LoggingConfig,
    pub platform: PlatformConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub removal: RemovalMode,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplingConfig {
    pub network_interval_seconds: u64,
    pub thermal_interval_seconds: u64,
    pub thermal_window: usize,
    pub interface_keying: InterfaceKeying,
    pub thermal_path: PathBuf,
    /// ask sysinfo for a cpu temperature when thermal_path can't be read
    pub component_fallback: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// None disables the log file
    pub directory: Option<PathBuf>,
    pub console_ansi: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PlatformConfig {
    /// a platform request that hasn't finished by then counts as failed
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        // the http session removes what it delivered, oldest first, so
        // readings added during a publish survive it
        Self { path: PathBuf::from(DEFAULT_STORE_PATH), removal: RemovalMode::OldestFirst }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            network_interval_seconds: 300,
            thermal_interval_seconds: 60,
            thermal_window: 5,
            interface_keying: InterfaceKeying::Legacy,
            thermal_path: PathBuf::from(DEFAULT_THERMAL_PATH),
            component_fallback: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: Some(PathBuf::from("./log_files")),
            console_ansi: true,
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { request_timeout_seconds: 30 }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { enabled: true, listen: "0.0.0.0:3000".to_string() }
    }
}

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: GatewayConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("gateway.toml"),
            PathBuf::from("..").join("config").join("gateway.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// an explicitly requested file must load; otherwise search the usual places
    pub fn resolve(explicit: Option<&Path>) -> anyhow::Result<Self> {
        match explicit {
            Some(path) => {
                let config = Self::load(path)?;
                println!("[CONFIG] Loaded from {}", path.display());
                Ok(config)
            }
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let sampling = &self.sampling;
        if sampling.network_interval_seconds == 0 || sampling.thermal_interval_seconds == 0 {
            anyhow::bail!("sampling intervals must be at least one second");
        }
        if sampling.thermal_window == 0 {
            anyhow::bail!("thermal_window must hold at least one sample");
        }
        if self.platform.request_timeout_seconds == 0 {
            anyhow::bail!("request_timeout_seconds must be at least one second");
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self, device: &DeviceConfig) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          GATEWAY CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Device: {}", device.device_key);
        println!("│ Platform: {}", device.platform_host);
        println!("│ Store: {}", self.store.path.display());
        println!("│ IP Interval: {}s", self.sampling.network_interval_seconds);
        println!(
            "│ CPU Interval: {}s (window {})",
            self.sampling.thermal_interval_seconds, self.sampling.thermal_window
        );
        println!("│ Request Timeout: {}s", self.platform.request_timeout_seconds);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::parse(content, Path::new("device.json"))
    }

    #[test]
    fn test_json_device_config() {
        let config = parse(
            r#"{"deviceKey": "gw-01", "devicePassword": "pw",
                "platformHost": "demo.example.com", "extra": 1}"#,
        )
        .unwrap();
        assert_eq!(config.device_key, "gw-01");
        assert_eq!(config.platform_host, "demo.example.com");
    }

    #[test]
    fn test_json_missing_field_is_malformed() {
        let err = parse(r#"{"deviceKey": "gw-01", "devicePassword": "pw"}"#).unwrap_err();
        match err {
            ConfigError::Malformed { reason, .. } => assert!(reason.contains("platformHost")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_legacy_line_config() {
        let config = parse("gw-01\npw\n\nhost:1883\n").unwrap();
        assert_eq!(config.device_password, "pw");
        assert_eq!(config.platform_host, "host:1883");
        assert!(matches!(parse("only-one-line"), Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn test_array_config() {
        let config = parse(r#"["gw-01", "pw", "host"]"#).unwrap();
        assert_eq!(config.device_key, "gw-01");
        assert!(matches!(parse(r#"["gw-01"]"#), Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn test_empty_field_rejected() {
        assert!(matches!(
            parse(r#"{"deviceKey": "", "devicePassword": "pw", "platformHost": "h"}"#),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DeviceConfig::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn test_partial_gateway_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
[sampling]
network_interval_seconds = 30
interface_keying = "full_name"

[store]
removal = "whole_group"

[platform]
request_timeout_seconds = 10
"#,
        )
        .unwrap();
        assert_eq!(config.sampling.network_interval_seconds, 30);
        assert_eq!(config.sampling.thermal_interval_seconds, 60);
        assert_eq!(config.sampling.interface_keying, InterfaceKeying::FullName);
        assert_eq!(config.store.removal, RemovalMode::WholeGroup);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.platform.request_timeout_seconds, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = GatewayConfig::default();
        config.sampling.thermal_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let mut config = GatewayConfig::default();
        assert_eq!(config.platform.request_timeout_seconds, 30);
        config.platform.request_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }
}
