use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerConfig::default(),
            hub: HubConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Read a value by dotted key, e.g. `server.port`
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["server", "port"] => Some(self.server.port.to_string()),
            ["server", "host"] => Some(self.server.host.clone()),
            ["hub", "max_connections"] => Some(self.hub.max_connections.to_string()),
            ["hub", "send_queue_capacity"] => Some(self.hub.send_queue_capacity.to_string()),
            ["hub", "ping_interval_secs"] => Some(self.hub.ping_interval_secs.to_string()),
            ["hub", "read_timeout_secs"] => Some(self.hub.read_timeout_secs.to_string()),
            ["hub", "write_timeout_secs"] => Some(self.hub.write_timeout_secs.to_string()),
            ["hub", "handshake_timeout_secs"] => Some(self.hub.handshake_timeout_secs.to_string()),
            ["hub", "batch_outbound"] => Some(self.hub.batch_outbound.to_string()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json"] => Some(self.logging.json.to_string()),
            ["logging", "file"] => self.logging.file.clone(),
            _ => None,
        }
    }

    /// Set a value by dotted key
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["server", "port"] => {
                self.server.port = parse_number(value, "port number")?;
            }
            ["server", "host"] => {
                self.server.host = value.to_string();
            }
            ["hub", "max_connections"] => {
                self.hub.max_connections = parse_number(value, "number")?;
            }
            ["hub", "send_queue_capacity"] => {
                self.hub.send_queue_capacity = parse_number(value, "number")?;
            }
            ["hub", "ping_interval_secs"] => {
                self.hub.ping_interval_secs = parse_number(value, "number")?;
            }
            ["hub", "read_timeout_secs"] => {
                self.hub.read_timeout_secs = parse_number(value, "number")?;
            }
            ["hub", "write_timeout_secs"] => {
                self.hub.write_timeout_secs = parse_number(value, "number")?;
            }
            ["hub", "handshake_timeout_secs"] => {
                self.hub.handshake_timeout_secs = parse_number(value, "number")?;
            }
            ["hub", "batch_outbound"] => {
                self.hub.batch_outbound = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid boolean: {}", value))
                })?;
            }
            ["logging", "level"] => {
                self.logging.level = value.parse()?;
            }
            ["logging", "json"] => {
                self.logging.json = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid boolean: {}", value))
                })?;
            }
            ["logging", "file"] => {
                self.logging.file = Some(value.to_string());
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid {}: {}", what, value)))
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Hub and per-session limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    /// Registered sessions allowed at once
    pub max_connections: usize,
    /// Outbound queue capacity per session
    pub send_queue_capacity: usize,
    /// Liveness ping interval (seconds)
    pub ping_interval_secs: u64,
    /// A connection silent for this long is considered dead (seconds)
    pub read_timeout_secs: u64,
    /// Deadline for a single outbound write (seconds)
    pub write_timeout_secs: u64,
    /// How long a new connection may take to send its username (seconds)
    pub handshake_timeout_secs: u64,
    /// Join already-queued messages into one frame
    #[serde(default = "default_batch_outbound")]
    pub batch_outbound: bool,
}

fn default_batch_outbound() -> bool {
    true
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            send_queue_capacity: 256,
            ping_interval_secs: 30,
            read_timeout_secs: 600,
            write_timeout_secs: 10,
            handshake_timeout_secs: 60,
            batch_outbound: true,
        }
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Optional log file; rotated daily
    pub file: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
