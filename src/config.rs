//! # Configuration Management
//!
//! Centralized configuration for workers, listeners, bundle transport and the
//! control panel protocol.
//!
//! Ports, certificates and timeouts are injected by the surrounding application;
//! this module only gives them a typed home with sane defaults and validation.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//!
//! ## Limits
//! - Bundles are capped at 64 MiB ([`MAX_BUNDLE_SIZE`]); configured limits may be
//!   lower but never higher
//! - Liveness base (10s) controls how far a pong pushes the connection deadline

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Magic bytes opening every accepted connection ("BNDL")
pub const MAGIC_BYTES: [u8; 4] = [0x42, 0x4E, 0x44, 0x4C];

/// Hard cap on a single bundle's declared length (2^26 bytes)
pub const MAX_BUNDLE_SIZE: usize = 1 << 26;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Worker thread configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Listener configuration
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Bundle transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Control panel protocol configuration
    #[serde(default)]
    pub protocol: ProtocolConfig,

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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration; an empty list means it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.worker.validate());
        errors.extend(self.listener.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.protocol.validate());
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

/// Per-worker event loop settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Number of worker threads in a pool
    pub threads: usize,

    /// Longest the loop sleeps on the multiplexer when idle
    #[serde(with = "duration_serde")]
    pub max_sleep: Duration,

    /// How long a stopping worker waits for connections to finish on their own
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,

    /// Polling interval of deadline watchdogs
    #[serde(with = "duration_serde")]
    pub watchdog_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            max_sleep: timeout::MAX_SLEEP,
            shutdown_grace: timeout::SHUTDOWN_TIMEOUT,
            watchdog_interval: timeout::WATCHDOG_INTERVAL,
        }
    }
}

impl WorkerConfig {
    /// Validate worker configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.threads == 0 {
            errors.push("Worker threads must be greater than 0".to_string());
        } else if self.threads > 256 {
            errors.push(format!(
                "Worker threads too high: {} (maximum: 256)",
                self.threads
            ));
        }

        if self.max_sleep.is_zero() {
            errors.push("Max sleep must be greater than 0".to_string());
        } else if self.max_sleep.as_secs() > 10 {
            errors.push("Max sleep too long (maximum: 10s)".to_string());
        }

        if self.shutdown_grace.as_secs() > 60 {
            errors.push("Shutdown grace too long (maximum: 60s)".to_string());
        }

        if self.watchdog_interval.as_millis() < 10 {
            errors.push("Watchdog interval too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Accepting side settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listen address (e.g., "127.0.0.1:9000"); port 0 picks an ephemeral port
    pub address: String,

    /// Deadline for TLS + connection header on a fresh socket
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
        }
    }
}

impl ListenerConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Listener address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listener address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Bundle framing settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest compressed bundle accepted or produced
    pub max_bundle_size: usize,

    /// DEFLATE level, 0-9
    pub compression_level: u32,

    /// Non-blocking attempts per `process()` call before yielding
    pub process_attempts: usize,

    /// Buffers kept per thread in the bundle buffer pool
    pub pool_max_buffers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_bundle_size: MAX_BUNDLE_SIZE,
            compression_level: 6,
            process_attempts: 8,
            pool_max_buffers: 16,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_bundle_size < 1024 {
            errors.push("Max bundle size too small (minimum: 1 KB)".to_string());
        } else if self.max_bundle_size > MAX_BUNDLE_SIZE {
            errors.push(format!(
                "Max bundle size too large: {} bytes (maximum: {MAX_BUNDLE_SIZE})",
                self.max_bundle_size
            ));
        }

        if self.compression_level > 9 {
            errors.push(format!(
                "Invalid compression level: {} (valid range: 0-9)",
                self.compression_level
            ));
        }

        if self.process_attempts == 0 {
            errors.push("Process attempts must be greater than 0".to_string());
        }

        errors
    }
}

/// Control panel protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    /// Interval between pings
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,

    /// Deadline granted by a pong is `liveness_base - ping`
    #[serde(with = "duration_serde")]
    pub liveness_base: Duration,

    /// Envelope encoding inside each bundle
    #[serde(default)]
    pub format: SerializationFormat,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ping_interval: timeout::KEEPALIVE_INTERVAL,
            liveness_base: timeout::LIVENESS_BASE,
            format: SerializationFormat::Json,
        }
    }
}

impl ProtocolConfig {
    /// Validate protocol configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ping_interval.as_millis() < 10 {
            errors.push("Ping interval too short (minimum: 10ms)".to_string());
        }

        if self.liveness_base <= self.ping_interval {
            errors.push(format!(
                "Liveness base ({}ms) must exceed ping interval ({}ms)",
                self.liveness_base.as_millis(),
                self.ping_interval.as_millis()
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

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("bundle-net"),
            log_level: Level::INFO,
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

        errors
    }
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
