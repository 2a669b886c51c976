//! # Configuration Management
//!
//! Centralized configuration for muxwire connections.
//!
//! This module provides structured configuration for the transport, the
//! service balancer, the key exchange and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`MUXWIRE_*`) via `from_env()`
//!
//! ## Security Considerations
//! - The default group is the 2048-bit RFC 3526 MODP group
//! - Peer-supplied moduli outside `min_modulus_bytes..=max_modulus_bytes` are refused
//! - Keys rotate every 30 seconds by default

use crate::core::packet;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Largest payload a frame can carry
pub const MAX_PAYLOAD_SIZE: usize = packet::MAX_PAYLOAD_SIZE;

/// Default number of packets a transport buffers for writing
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default services visited per tick in each tier
pub const DEFAULT_HIGH_LIMIT: usize = 20;
pub const DEFAULT_MED_LIMIT: usize = 15;
pub const DEFAULT_LOW_LIMIT: usize = 10;

/// Default scheduling tick of the session driver
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(5);

/// Default key lifetime before a rekey is due
pub const DEFAULT_REKEY_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of sealed packets before a rekey is due
pub const DEFAULT_REKEY_PACKET_LIMIT: u64 = 10_000;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Socket and framing configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Service scheduling configuration
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Key exchange and rekey configuration
    #[serde(default)]
    pub crypto: CryptoConfig,

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
    ///
    /// Unset or unparsable variables leave the default in place.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MUXWIRE_ADDRESS") {
            config.transport.address = addr;
        }

        if let Some(val) = env_parse::<u32>("MUXWIRE_BACKLOG") {
            config.transport.backlog = val;
        }

        if let Some(val) = env_parse::<u64>("MUXWIRE_CONNECT_TIMEOUT_MS") {
            config.transport.connect_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<usize>("MUXWIRE_MAX_PAYLOAD_SIZE") {
            config.transport.max_payload_size = val;
        }

        if let Some(val) = env_parse::<u64>("MUXWIRE_TICK_INTERVAL_MS") {
            config.balancer.tick_interval = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("MUXWIRE_REKEY_INTERVAL_MS") {
            config.crypto.rekey_interval = Duration::from_millis(val);
        }

        if let Ok(level) = std::env::var("MUXWIRE_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid log level in MUXWIRE_LOG_LEVEL: {level}"))
            })?;
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
        errors.extend(self.transport.validate());
        errors.extend(self.balancer.validate());
        errors.extend(self.crypto.validate());
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

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Listen or connect address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Pending connection queue length for listeners
    pub backlog: u32,

    /// Timeout for outbound connection attempts
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Time allowed to flush the write half on close
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum payload per frame, at most 65,535
    pub max_payload_size: usize,

    /// Disable Nagle's algorithm on TCP sockets
    pub nodelay: bool,

    /// Packets buffered for writing before `enqueue` reports a full queue
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            backlog: 128,
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            max_payload_size: MAX_PAYLOAD_SIZE,
            nodelay: true,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Transport address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid transport address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.backlog == 0 {
            errors.push("Backlog must be greater than 0".to_string());
        }

        if self.connect_timeout.as_millis() < 100 {
            errors.push("Connect timeout too short (minimum: 100ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum: {MAX_PAYLOAD_SIZE})",
                self.max_payload_size
            ));
        }

        if self.outbound_capacity == 0 {
            errors.push("Outbound queue capacity cannot be 0".to_string());
        }

        errors
    }
}

/// Service scheduling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Services visited per tick in the high tier
    pub high_limit: usize,

    /// Services visited per tick in the medium tier
    pub med_limit: usize,

    /// Services visited per tick in the low tier
    pub low_limit: usize,

    /// Interval between outbound collection passes
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            high_limit: DEFAULT_HIGH_LIMIT,
            med_limit: DEFAULT_MED_LIMIT,
            low_limit: DEFAULT_LOW_LIMIT,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl BalancerConfig {
    /// Validate balancer configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.high_limit == 0 && self.med_limit == 0 && self.low_limit == 0 {
            errors.push("At least one tier limit must be greater than 0".to_string());
        }

        if self.tick_interval.is_zero() {
            errors.push("Tick interval cannot be 0".to_string());
        } else if self.tick_interval.as_secs() > 1 {
            errors.push("Tick interval too long (maximum: 1s)".to_string());
        }

        errors
    }
}

/// Diffie-Hellman group selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// RFC 3526 group 14 (2048-bit safe prime, g = 2)
    #[default]
    Modp2048,
    /// Fresh random modulus and generator per handshake
    Random,
}

/// Which side of a connection starts timed rekeys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RekeyPolicy {
    /// Only the side that opened the connection
    Initiator,
    /// Only the side that accepted the connection
    #[default]
    Responder,
    /// Either side when its own timer expires
    Either,
}

/// Key exchange configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Group used when this side generates a request
    pub group: GroupKind,

    /// Modulus width for `GroupKind::Random`
    pub random_modulus_bytes: usize,

    /// Private exponent width
    pub exponent_bytes: usize,

    /// Smallest peer modulus accepted
    pub min_modulus_bytes: usize,

    /// Largest peer modulus accepted
    pub max_modulus_bytes: usize,

    /// Key lifetime before a timed rekey
    #[serde(with = "duration_serde")]
    pub rekey_interval: Duration,

    /// Sealed packets before a rekey; 0 disables the count trigger
    pub rekey_packet_limit: u64,

    /// Which side starts timed rekeys
    pub rekey_policy: RekeyPolicy,

    /// Bound on reaching the mutually keyed state, and on every later
    /// exchange this side starts
    #[serde(with = "duration_serde")]
    pub establish_timeout: Duration,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            group: GroupKind::default(),
            random_modulus_bytes: 256,
            exponent_bytes: 32,
            min_modulus_bytes: 128,
            max_modulus_bytes: 1024,
            rekey_interval: DEFAULT_REKEY_INTERVAL,
            rekey_packet_limit: DEFAULT_REKEY_PACKET_LIMIT,
            rekey_policy: RekeyPolicy::default(),
            establish_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl CryptoConfig {
    /// Validate key exchange configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.min_modulus_bytes < 8 {
            errors.push("Min modulus size too small (minimum: 8 bytes)".to_string());
        }

        if self.min_modulus_bytes > self.max_modulus_bytes {
            errors.push("Min modulus size cannot exceed max modulus size".to_string());
        }

        if self.group == GroupKind::Random
            && (self.random_modulus_bytes < self.min_modulus_bytes
                || self.random_modulus_bytes > self.max_modulus_bytes)
        {
            errors.push(format!(
                "Random modulus size {} outside accepted range {}..={}",
                self.random_modulus_bytes, self.min_modulus_bytes, self.max_modulus_bytes
            ));
        }

        if self.exponent_bytes < 16 {
            errors.push("Exponent size too small (minimum: 16 bytes)".to_string());
        } else if self.exponent_bytes > 512 {
            errors.push("Exponent size too large (maximum: 512 bytes)".to_string());
        }

        if self.rekey_interval.as_millis() < 100 {
            errors.push("Rekey interval too short (minimum: 100ms)".to_string());
        }

        if self.establish_timeout.as_millis() < 100 {
            errors.push("Establish timeout too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
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
            app_name: String::from("muxwire"),
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
                if let Some(parent) = std::path::Path::new(path).parent() {
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
