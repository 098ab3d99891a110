//! Server configuration.
//!
//! [`ServerConfig`] is what the server runs with. It can be built in code
//! with the `with_*` builders or loaded from `server.toml`
//! (`~/.config/picam/server.toml` by default), where durations are given
//! in seconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use picam_protocol::{DEFAULT_COMMAND_PORT, DEFAULT_DATA_PORT, DEFAULT_STREAM_PORT};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host the command and data listeners bind to.
    pub bind_host: String,

    /// Command channel port.
    pub command_port: u16,

    /// Data channel port.
    pub data_port: u16,

    /// UDP port on the client that live streams are sent to.
    pub stream_port: u16,

    /// Deadline for each reply and each media chunk write.
    pub write_timeout: Duration,

    /// Idle deadline between commands. `None` waits forever.
    pub idle_timeout: Option<Duration>,

    /// How long to wait for the client to open the data connection.
    pub data_accept_timeout: Duration,

    /// How long an accepted data connection has to send its hello.
    pub hello_timeout: Duration,

    /// Deadline for stopping the camera and draining a session.
    pub teardown_timeout: Duration,

    /// Pause between starting the sensor and focusing.
    pub settle_delay: Duration,

    /// Maximum concurrent control connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            command_port: DEFAULT_COMMAND_PORT,
            data_port: DEFAULT_DATA_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            write_timeout: Duration::from_secs(30),
            idle_timeout: None,
            data_accept_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(5),
            teardown_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(200),
            max_connections: 16,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration bound to `host` with default ports.
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            ..Default::default()
        }
    }

    /// Configuration for tests: loopback, ephemeral ports, no settle delay.
    pub fn ephemeral() -> Self {
        Self::new("127.0.0.1")
            .with_ports(0, 0)
            .with_settle_delay(Duration::ZERO)
    }

    /// Builder: set command and data ports. `0` picks a free port.
    pub fn with_ports(mut self, command_port: u16, data_port: u16) -> Self {
        self.command_port = command_port;
        self.data_port = data_port;
        self
    }

    /// Builder: set the client-side UDP stream port.
    pub fn with_stream_port(mut self, port: u16) -> Self {
        self.stream_port = port;
        self
    }

    /// Builder: set write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Builder: set idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Builder: set data accept timeout.
    pub fn with_data_accept_timeout(mut self, timeout: Duration) -> Self {
        self.data_accept_timeout = timeout;
        self
    }

    /// Builder: set settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Address of the command listener.
    pub fn command_addr(&self) -> ServerResult<SocketAddr> {
        socket_addr(&self.bind_host, self.command_port)
    }

    /// Address of the data listener.
    pub fn data_addr(&self) -> ServerResult<SocketAddr> {
        socket_addr(&self.bind_host, self.data_port)
    }

    /// Loads configuration from a TOML file.
    pub fn load_from(path: &Path) -> ServerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Loads the default file if it exists, otherwise returns defaults.
    pub fn load() -> ServerResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> ServerResult<Self> {
        let settings: ServerSettings = toml::from_str(content)
            .map_err(|e| ServerError::config(format!("failed to parse config: {e}")))?;
        Ok(settings.into())
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("picam")
            .join("server.toml")
    }
}

fn socket_addr(host: &str, port: u16) -> ServerResult<SocketAddr> {
    let text = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    text.parse()
        .map_err(|e| ServerError::config(format!("invalid bind address '{text}': {e}")))
}

/// On-disk form of [`ServerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_host: String,
    pub command_port: u16,
    pub data_port: u16,
    pub stream_port: u16,
    pub max_connections: usize,
    pub timeouts: TimeoutSettings,
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub write: f64,
    /// Omitted or zero disables the idle timeout.
    pub idle: Option<f64>,
    pub data_accept: f64,
    pub hello: f64,
    pub teardown: f64,
    pub settle: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            bind_host: config.bind_host,
            command_port: config.command_port,
            data_port: config.data_port,
            stream_port: config.stream_port,
            max_connections: config.max_connections,
            timeouts: TimeoutSettings::default(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let config = ServerConfig::default();
        Self {
            write: config.write_timeout.as_secs_f64(),
            idle: None,
            data_accept: config.data_accept_timeout.as_secs_f64(),
            hello: config.hello_timeout.as_secs_f64(),
            teardown: config.teardown_timeout.as_secs_f64(),
            settle: config.settle_delay.as_secs_f64(),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl From<ServerSettings> for ServerConfig {
    fn from(settings: ServerSettings) -> Self {
        let t = settings.timeouts;
        Self {
            bind_host: settings.bind_host,
            command_port: settings.command_port,
            data_port: settings.data_port,
            stream_port: settings.stream_port,
            write_timeout: seconds(t.write),
            idle_timeout: t.idle.filter(|s| *s > 0.0).map(seconds),
            data_accept_timeout: seconds(t.data_accept),
            hello_timeout: seconds(t.hello),
            teardown_timeout: seconds(t.teardown),
            settle_delay: seconds(t.settle),
            max_connections: settings.max_connections.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.command_port, 8000);
        assert_eq!(config.data_port, 8001);
        assert_eq!(config.stream_port, 8002);
        assert_eq!(config.write_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.settle_delay, Duration::from_millis(200));
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::new("127.0.0.1")
            .with_ports(9000, 9001)
            .with_write_timeout(Duration::from_secs(5))
            .with_idle_timeout(Some(Duration::from_secs(60)))
            .with_max_connections(2);

        assert_eq!(
            config.command_addr().unwrap(),
            "127.0.0.1:9000".parse().unwrap()
        );
        assert_eq!(config.data_addr().unwrap().port(), 9001);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_connections, 2);
    }

    #[test]
    fn ipv6_bind_host() {
        let config = ServerConfig::new("::1").with_ports(8000, 8001);
        assert_eq!(config.command_addr().unwrap(), "[::1]:8000".parse().unwrap());
    }

    #[test]
    fn invalid_bind_host_is_config_error() {
        let config = ServerConfig::new("not a host");
        assert!(matches!(config.command_addr(), Err(ServerError::Config { .. })));
    }

    #[test]
    fn toml_partial_overrides() {
        let config = ServerConfig::from_toml(
            r#"
            command_port = 9100

            [timeouts]
            write = 2.5
            idle = 120
            settle = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.command_port, 9100);
        assert_eq!(config.data_port, 8001);
        assert_eq!(config.write_timeout, Duration::from_millis(2500));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.settle_delay, Duration::ZERO);
        assert_eq!(config.data_accept_timeout, Duration::from_secs(10));
    }

    #[test]
    fn toml_zero_idle_disables_timeout() {
        let config = ServerConfig::from_toml("[timeouts]\nidle = 0\n").unwrap();
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn toml_parse_error() {
        let err = ServerConfig::from_toml("command_port = \"eight\"").unwrap_err();
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "bind_host = \"127.0.0.1\"\nstream_port = 5000\n").unwrap();

        let config = ServerConfig::load_from(&path).unwrap();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.stream_port, 5000);
    }

    #[test]
    fn default_path_is_under_picam() {
        let path = ServerConfig::default_path();
        assert!(path.ends_with("picam/server.toml"));
    }
}
