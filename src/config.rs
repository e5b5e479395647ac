//! Configuration for the capture agent.
//!
//! The config file is JSON:
//!
//! ```json
//! {
//!   "devices": ["D1:B2:C3:D4:E5:F6", {"mac": "F6:E5:D4:C3:B2:A1", "name": "Wrist"}],
//!   "sensors": {"Accelerometer": 100.0, "Gyroscope": 100.0},
//!   "cloudLogin": {"username": "lab", "password": "..."}
//! }
//! ```

use crate::cloud::CloudCredentials;
use crate::connection::{ConnectionSettings, ReconnectPolicy};
use crate::download::DownloadOptions;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Devices to capture from
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,

    /// Sensor name to output data rate (Hz), used in stream mode
    #[serde(default)]
    pub sensors: BTreeMap<String, f32>,

    /// Login for cloud sync; sync is off without it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_login: Option<CloudCredentials>,

    /// Cloud service base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_endpoint: Option<String>,

    /// Directory capture files are written to
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Device state cache file
    #[serde(default = "default_cache")]
    pub cache: PathBuf,

    #[serde(default)]
    pub connection: ConnectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            sensors: BTreeMap::new(),
            cloud_login: None,
            cloud_endpoint: None,
            output: default_output(),
            cache: default_cache(),
            connection: ConnectionConfig::default(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blelog")
}

fn default_output() -> PathBuf {
    PathBuf::from("output")
}

fn default_cache() -> PathBuf {
    data_dir().join(".cache.json")
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load configuration from the default location, or defaults when absent.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();
        if config_path.exists() {
            Self::from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the path to the default configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blelog")
            .join("config.json")
    }

    /// Check that the config describes something to do.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        for entry in &self.devices {
            validate_address(&entry.mac)?;
        }
        for (name, hz) in &self.sensors {
            if !hz.is_finite() || *hz <= 0.0 {
                return Err(ConfigError::InvalidRate {
                    sensor: name.clone(),
                    value: hz.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A device to capture from.
///
/// In JSON either a bare address string or `{"mac": .., "name": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEntry {
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DeviceEntry {
    pub fn new(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into(),
            name: None,
        }
    }

    /// Parse a `MAC[=NAME]` command line argument.
    pub fn parse(arg: &str) -> Result<Self, ConfigError> {
        let (mac, name) = match arg.split_once('=') {
            Some((mac, name)) => (mac.trim(), Some(name.trim())),
            None => (arg.trim(), None),
        };
        validate_address(mac)?;
        Ok(Self {
            mac: mac.to_string(),
            name: name.filter(|n| !n.is_empty()).map(str::to_string),
        })
    }
}

impl<'de> Deserialize<'de> for DeviceEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Address(String),
            Full { mac: String, name: Option<String> },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Address(mac) => DeviceEntry { mac, name: None },
            Raw::Full { mac, name } => DeviceEntry { mac, name },
        })
    }
}

/// Parse a `NAME=HZ` command line argument.
pub fn parse_sensor_rate(arg: &str) -> Result<(String, f32), ConfigError> {
    let (name, hz) = arg
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidSensorArg(arg.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidSensorArg(arg.to_string()));
    }
    let value: f32 = hz.trim().parse().map_err(|_| ConfigError::InvalidRate {
        sensor: name.to_string(),
        value: hz.trim().to_string(),
    })?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidRate {
            sensor: name.to_string(),
            value: hz.trim().to_string(),
        });
    }
    Ok((name.to_string(), value))
}

/// Six colon-separated hex octets.
fn validate_address(mac: &str) -> Result<(), ConfigError> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidAddress(mac.to_string()))
    }
}

/// Connection timing and retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub discovery_timeout_secs: u64,
    pub setup_timeout_secs: u64,
    /// Reconnect budget after the pre-download reset
    pub download_reconnect_attempts: u32,
    /// Reconnect budget while streaming; `None` retries forever
    pub stream_reconnect_attempts: Option<u32>,
    pub settle_millis: u64,
    /// Log entries between download progress notifications
    pub notify_every: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: 10,
            setup_timeout_secs: 10,
            download_reconnect_attempts: 3,
            stream_reconnect_attempts: None,
            settle_millis: 1000,
            notify_every: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            setup_timeout: Duration::from_secs(self.setup_timeout_secs),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            reconnect_attempts: self.download_reconnect_attempts,
            settle: Duration::from_millis(self.settle_millis),
            notify_every: self.notify_every.max(1),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialize error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("'{0}' is not a device address (expected AA:BB:CC:DD:EE:FF)")]
    InvalidAddress(String),

    #[error("'{0}' is not a sensor setting (expected NAME=HZ)")]
    InvalidSensorArg(String),

    #[error("invalid data rate '{value}' for sensor {sensor}")]
    InvalidRate { sensor: String, value: String },

    #[error("no devices configured")]
    NoDevices,
}
