//! Simulator configuration.
//!
//! The configuration is a TOML file with three sections:
//!
//! ```toml
//! [cloud]
//! api_key = "..."
//! device_id = "kid-gps-sim-001"
//!
//! [simulation]
//! location_interval_seconds = 300
//! temperature_interval_seconds = 300
//!
//! [mqtt]
//! port = 8883
//! ```
//!
//! Every field except `cloud.api_key` has a default. A handful of cloud
//! settings can be overridden through environment variables (see
//! [`env_vars`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default endpoint constants
pub mod endpoints {
    pub const API_HOST: &str = "https://api.nrfcloud.com";
    pub const MQTT_HOST: &str = "mqtt.nrfcloud.com";
    pub const ROOT_CA_URL: &str = "https://www.amazontrust.com/repository/AmazonRootCA1.pem";
    pub const MQTT_TLS_PORT: u16 = 8883;
}

/// Environment variable names
pub mod env_vars {
    pub const API_KEY: &str = "TRACKERSIM_API_KEY";
    pub const API_HOST: &str = "TRACKERSIM_API_HOST";
    pub const DEVICE_ID: &str = "TRACKERSIM_DEVICE_ID";
    pub const CERTS_DIR: &str = "TRACKERSIM_CERTS_DIR";
    pub const LOG_JSON: &str = "TRACKERSIM_LOG_JSON";
}

/// Fixed timing constants that are not exposed in the config file.
pub mod timing {
    use std::time::Duration;

    /// Delay before the first location fix.
    pub const LOCATION_WARMUP: Duration = Duration::from_secs(5);
    /// Delay before the first temperature reading.
    pub const TEMPERATURE_WARMUP: Duration = Duration::from_secs(10);
    /// How long diagnostics hold a bare connection open.
    pub const DIAG_HOLD: Duration = Duration::from_secs(10);
    /// Observation window after the diagnostic subscribe probe.
    pub const DIAG_SUBSCRIBE_SETTLE: Duration = Duration::from_secs(3);
    /// Resolution of every sleep-and-check loop.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
}

/// Placeholder marker left in the shipped template.
const PLACEHOLDER_MARKER: &str = "<YOUR_";

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Cloud account and device identity
    pub cloud: CloudConfig,

    /// Telemetry generation settings
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Transport settings
    #[serde(default)]
    pub mqtt: MqttSettings,
}

/// Cloud account settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// REST API key (Bearer token)
    #[serde(default)]
    pub api_key: String,

    /// REST API base URL
    #[serde(default = "default_api_host")]
    pub api_host: String,

    /// Device identifier used for the client id, file names and topics
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Directory holding key, certificate, trust anchor and connection cache
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,

    /// Well-known location of the trust anchor
    #[serde(default = "default_root_ca_url")]
    pub root_ca_url: String,
}

/// Telemetry generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Initial location reporting interval (shadow-controlled afterwards)
    #[serde(default = "default_interval")]
    pub location_interval_seconds: u64,

    /// Temperature reporting interval
    #[serde(default = "default_interval")]
    pub temperature_interval_seconds: u64,

    /// Baseline temperature in degrees Celsius
    #[serde(default = "default_temperature_base")]
    pub temperature_base: f64,

    /// Amplitude of the diurnal temperature swing
    #[serde(default = "default_temperature_variation")]
    pub temperature_variation: f64,

    /// Application version reported in the device-info snapshot
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

/// Transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker TLS port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Budget for the initial connect handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Pause between subscribe and the startup snapshot
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Reconnect backoff floor
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_delay_secs: u64,

    /// Reconnect backoff ceiling
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_secs: u64,
}

fn default_api_host() -> String {
    endpoints::API_HOST.to_string()
}

fn default_device_id() -> String {
    "kid-gps-sim-001".to_string()
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_root_ca_url() -> String {
    endpoints::ROOT_CA_URL.to_string()
}

fn default_interval() -> u64 {
    300
}

fn default_temperature_base() -> f64 {
    22.0
}

fn default_temperature_variation() -> f64 {
    5.0
}

fn default_app_version() -> String {
    "0.0.1".to_string()
}

fn default_port() -> u16 {
    endpoints::MQTT_TLS_PORT
}

fn default_keep_alive() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_settle_delay() -> u64 {
    2
}

fn default_reconnect_min() -> u64 {
    1
}

fn default_reconnect_max() -> u64 {
    30
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            location_interval_seconds: default_interval(),
            temperature_interval_seconds: default_interval(),
            temperature_base: default_temperature_base(),
            temperature_variation: default_temperature_variation(),
            app_version: default_app_version(),
        }
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            settle_delay_secs: default_settle_delay(),
            reconnect_min_delay_secs: default_reconnect_min(),
            reconnect_max_delay_secs: default_reconnect_max(),
        }
    }
}

impl CloudConfig {
    /// Create a cloud config with defaults for everything but the key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_host: default_api_host(),
            device_id: default_device_id(),
            certs_dir: default_certs_dir(),
            root_ca_url: default_root_ca_url(),
        }
    }
}

impl MqttSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn reconnect_min_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_min_delay_secs)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_delay_secs)
    }
}

impl SimulatorConfig {
    /// Build a config for `device_id` with every other value defaulted.
    pub fn new(api_key: impl Into<String>, device_id: impl Into<String>) -> Self {
        let mut cloud = CloudConfig::new(api_key);
        cloud.device_id = device_id.into();
        Self {
            cloud,
            simulation: SimulationConfig::default(),
            mqtt: MqttSettings::default(),
        }
    }

    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::debug!(
            path = %path.display(),
            device_id = %config.cloud.device_id,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse without environment overrides or validation.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Replace cloud settings with any values present in the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(env_vars::API_KEY) {
            self.cloud.api_key = key;
        }
        if let Some(host) = non_empty(env_vars::API_HOST) {
            self.cloud.api_host = host;
        }
        if let Some(id) = non_empty(env_vars::DEVICE_ID) {
            self.cloud.device_id = id;
        }
        if let Some(dir) = non_empty(env_vars::CERTS_DIR) {
            self.cloud.certs_dir = PathBuf::from(dir);
        }
    }

    /// Check the invariants the rest of the simulator relies on.
    pub fn validate(&self) -> ConfigResult<()> {
        let key = self.cloud.api_key.trim();
        if key.is_empty() || key.contains(PLACEHOLDER_MARKER) {
            return Err(ConfigError::Invalid(format!(
                "cloud.api_key is not set (edit the config file or set {})",
                env_vars::API_KEY
            )));
        }

        validate_device_id(&self.cloud.device_id)?;

        let sim = &self.simulation;
        if sim.location_interval_seconds == 0 || sim.temperature_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "simulation intervals must be positive".to_string(),
            ));
        }

        let mqtt = &self.mqtt;
        if mqtt.connect_timeout_secs == 0 || mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.connect_timeout_secs and mqtt.keep_alive_secs must be positive".to_string(),
            ));
        }
        if mqtt.reconnect_min_delay_secs == 0
            || mqtt.reconnect_min_delay_secs > mqtt.reconnect_max_delay_secs
        {
            return Err(ConfigError::Invalid(format!(
                "reconnect delays must satisfy 0 < min ({}) <= max ({})",
                mqtt.reconnect_min_delay_secs, mqtt.reconnect_max_delay_secs
            )));
        }

        Ok(())
    }
}

/// Device ids end up in file names, topic segments and a certificate
/// subject, so only a conservative character set is accepted.
pub fn validate_device_id(device_id: &str) -> ConfigResult<()> {
    if device_id.is_empty() {
        return Err(ConfigError::Invalid("cloud.device_id is empty".to_string()));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !device_id.chars().all(allowed) || device_id.starts_with('.') {
        return Err(ConfigError::Invalid(format!(
            "cloud.device_id '{}' may only contain letters, digits, '-', '_' and '.'",
            device_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [cloud]
        api_key = "secret"
    "#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = SimulatorConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.cloud.api_host, endpoints::API_HOST);
        assert_eq!(config.cloud.device_id, "kid-gps-sim-001");
        assert_eq!(config.cloud.certs_dir, PathBuf::from("certs"));
        assert_eq!(config.simulation.location_interval_seconds, 300);
        assert_eq!(config.simulation.app_version, "0.0.1");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.connect_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_placeholder_key_rejected() {
        let config = SimulatorConfig::new("<YOUR_API_KEY>", "dev-1");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_device_id_validation() {
        assert!(validate_device_id("kid-gps_sim.001").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("../escape").is_err());
        assert!(validate_device_id("a b").is_err());
        assert!(validate_device_id("id;rm -rf").is_err());
    }

    #[test]
    fn test_reconnect_bounds_validated() {
        let mut config = SimulatorConfig::new("key", "dev-1");
        config.mqtt.reconnect_min_delay_secs = 40;
        assert!(config.validate().is_err());
        config.mqtt.reconnect_min_delay_secs = 0;
        assert!(config.validate().is_err());
        config.mqtt.reconnect_min_delay_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = SimulatorConfig::new("key", "dev-1");
        config.simulation.location_interval_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_replace_cloud_values() {
        let mut config = SimulatorConfig::from_toml_str(MINIMAL).unwrap();
        config.apply_overrides(|key| match key {
            env_vars::DEVICE_ID => Some("override-7".to_string()),
            env_vars::CERTS_DIR => Some("/tmp/certs".to_string()),
            env_vars::API_HOST => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(config.cloud.device_id, "override-7");
        assert_eq!(config.cloud.certs_dir, PathBuf::from("/tmp/certs"));
        // blank values are ignored
        assert_eq!(config.cloud.api_host, endpoints::API_HOST);
        assert_eq!(config.cloud.api_key, "secret");
    }
}
