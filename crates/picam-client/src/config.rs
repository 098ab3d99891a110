//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/picam/config.toml` by default. Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use picam_protocol::{DEFAULT_COMMAND_PORT, DEFAULT_DATA_PORT};

use crate::error::{ClientError, ClientResult};

/// Configuration for the picam client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Debug mode.
    pub debug: bool,

    /// Camera server address.
    pub server: ServerSettings,

    /// Network deadlines.
    pub timeouts: TimeoutSettings,

    /// Where received media is written.
    pub output: OutputSettings,
}

/// Camera server address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub command_port: u16,
    pub data_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            command_port: DEFAULT_COMMAND_PORT,
            data_port: DEFAULT_DATA_PORT,
        }
    }
}

/// Network deadlines in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Opening the command or a data connection.
    pub connect: f64,
    /// One command round trip.
    pub command: f64,
    /// Each read on the data channel.
    pub transfer: f64,
    /// Waiting for a background recording to finish after stop.
    pub stop_join: f64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect: 5.0,
            command: 30.0,
            transfer: 30.0,
            stop_join: 30.0,
        }
    }
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Default directory for captured pictures and recordings.
    pub directory: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
        }
    }
}

/// Resolved timeouts used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub command: Duration,
    pub transfer: Duration,
    pub stop_join: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        TimeoutSettings::default().resolve()
    }
}

impl TimeoutSettings {
    /// Converts seconds into durations.
    pub fn resolve(&self) -> Timeouts {
        let secs = |v: f64| Duration::try_from_secs_f64(v.max(0.0)).unwrap_or(Duration::MAX);
        Timeouts {
            connect: secs(self.connect),
            command: secs(self.command),
            transfer: secs(self.transfer),
            stop_join: secs(self.stop_join),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default path, or defaults if absent.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read config: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("picam")
    }

    /// `host:port` of the command channel.
    pub fn command_endpoint(&self) -> String {
        endpoint(&self.server.host, self.server.command_port)
    }

    /// `host:port` of the data channel.
    pub fn data_endpoint(&self) -> String {
        endpoint(&self.server.host, self.server.data_port)
    }
}

fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
