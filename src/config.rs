//! # Configuration Management
//!
//! Centralized configuration for the transfer engine.
//!
//! This module provides structured configuration for the accepting side (server),
//! the dialing side (client), the transfer manager, the wire transport and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`FILEWIRE_*`)
//!
//! ## Protocol Constants
//! The chunk size and header layout are protocol constants, not settings: both
//! peers must agree on them and they are never negotiated.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Bytes per segment; the last segment of a file may be shorter
pub const CHUNK_SIZE: usize = 4096;

/// Fixed frame header: length(4) + reserved(8) + message type(4)
pub const HEADER_LEN: usize = 16;

/// Byte offset of the message type tag inside a frame
pub const TYPE_OFFSET: usize = 12;

/// Max allowed frame size (e.g. 16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Connect attempts before a session reports `ConnectionFailed`
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Transfer manager configuration
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("FILEWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(dir) = std::env::var("FILEWIRE_DOWNLOAD_DIR") {
            config.transfer.download_dir = PathBuf::from(dir);
        }

        if let Ok(attempts) = std::env::var("FILEWIRE_CONNECT_ATTEMPTS") {
            if let Ok(val) = attempts.parse::<u32>() {
                config.client.connect_attempts = val;
            }
        }

        if let Ok(timeout) = std::env::var("FILEWIRE_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(heartbeat) = std::env::var("FILEWIRE_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = heartbeat.parse::<u64>() {
                config.server.heartbeat_interval = Duration::from_millis(val);
                config.client.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("FILEWIRE_LOG_LEVEL") {
            let level = level
                .parse::<Level>()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
            config.logging.log_level = level;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.transfer.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Accepting-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:9000")
    pub address: String,

    /// Outbound frames queued per connection before `send` waits
    pub backpressure_limit: usize,

    /// Close a connection after this long without inbound traffic
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Interval for sending heartbeat messages
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Budget for a single outbound frame write
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Timeout for graceful server shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            backpressure_limit: 32,
            idle_timeout: timeout::IDLE_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            send_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_connections: 256,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:9000')",
                self.address
            ));
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        } else if self.backpressure_limit > 1_000_000 {
            errors.push(format!(
                "Backpressure limit too large: {} (max recommended: 1,000,000)",
                self.backpressure_limit
            ));
        }

        errors.extend(validate_liveness(
            "Server",
            self.heartbeat_interval,
            self.idle_timeout,
        ));

        if self.send_timeout.as_millis() < 10 {
            errors.push("Send timeout too short (minimum: 10ms)".to_string());
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        }

        errors
    }
}

/// Dialing-side configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Timeout for a single connection attempt
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Timeout for individual operations (a frame write, waiting for the token)
    #[serde(with = "duration_serde")]
    pub operation_timeout: Duration,

    /// Close the connection after this long without inbound traffic
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Interval for sending heartbeat messages
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Connect attempts before giving up
    pub connect_attempts: u32,

    /// Fixed delay between connect attempts
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,

    /// Outbound frames queued before `send` waits
    pub backpressure_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            operation_timeout: timeout::DEFAULT_TIMEOUT,
            idle_timeout: timeout::IDLE_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_delay: Duration::from_millis(500),
            backpressure_limit: 32,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.operation_timeout.as_millis() < 10 {
            errors.push("Operation timeout too short (minimum: 10ms)".to_string());
        }

        errors.extend(validate_liveness(
            "Client",
            self.heartbeat_interval,
            self.idle_timeout,
        ));

        if self.connect_attempts == 0 {
            errors.push("Connect attempts must be greater than 0".to_string());
        } else if self.connect_attempts > 10 {
            errors.push(format!(
                "Connect attempts too high: {} (maximum: 10)",
                self.connect_attempts
            ));
        }

        if self.retry_delay.as_secs() > 60 {
            errors.push("Retry delay too long (maximum: 60s)".to_string());
        }

        if self.backpressure_limit == 0 {
            errors.push("Backpressure limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Transfer manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    /// Directory where received files are written
    pub download_dir: PathBuf,

    /// Inbound messages buffered per active transfer before the read loop waits
    pub queue_depth: usize,

    /// How long a transfer waits for the peer's next message (accept, ack,
    /// segment or completion) before it is failed
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            queue_depth: 16,
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl TransferConfig {
    /// Validate transfer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.download_dir.as_os_str().is_empty() {
            errors.push("Download directory cannot be empty".to_string());
        }

        if self.queue_depth == 0 {
            errors.push("Transfer queue depth must be greater than 0".to_string());
        } else if self.queue_depth > 65_536 {
            errors.push(format!(
                "Transfer queue depth too large: {} (maximum: 65,536)",
                self.queue_depth
            ));
        }

        if self.response_timeout.as_millis() < 100 {
            errors.push("Response timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum allowed frame size in bytes (header included)
    pub max_frame_size: usize,

    /// Disable Nagle's algorithm on connected sockets
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        // A frame must at least hold the header plus one full segment
        let minimum = HEADER_LEN + CHUNK_SIZE + 64;
        if self.max_frame_size < minimum {
            errors.push(format!(
                "Max frame size too small: {} bytes (minimum: {minimum})",
                self.max_frame_size
            ));
        } else if self.max_frame_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("filewire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

fn validate_liveness(side: &str, heartbeat: Duration, idle: Duration) -> Vec<String> {
    let mut errors = Vec::new();

    if heartbeat.as_millis() < 100 {
        errors.push(format!("{side} heartbeat interval too short (minimum: 100ms)"));
    } else if heartbeat.as_secs() > 3600 {
        errors.push(format!("{side} heartbeat interval too long (maximum: 1 hour)"));
    }

    // The peer must see at least one heartbeat before declaring us idle
    if idle <= heartbeat {
        errors.push(format!(
            "{side} idle timeout must be longer than the heartbeat interval"
        ));
    }

    errors
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
