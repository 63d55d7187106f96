//! Client configuration.
//!
//! Configuration lives in a single TOML file. Every section and field has a
//! default, so an empty file (or no file at all) yields a working client for a
//! controller on localhost.
//!
//! ```toml
//! [shared]
//! log_level = "debug"
//! service_name = "gbc-client-cell-02"
//!
//! [connection]
//! url = "ws://10.0.0.12:9001/ws"
//!
//! [stream]
//! min_capacity = 20
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::consts::{
    DEFAULT_MIN_CAPACITY, DEFAULT_URL, INITIAL_CONTROL_WORD, MAX_HEARTBEAT_HZ, MAX_TIMEOUT_S,
};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// File unreadable or TOML invalid.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// A value is outside its accepted range.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Logging verbosity, lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Fields common to every process that embeds the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Instance identifier, attached to log output.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "gbc-client".to_string()
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: default_service_name(),
        }
    }
}

impl SharedConfig {
    /// # Errors
    ///
    /// `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Websocket endpoint of the controller.
    pub url: String,
    /// Delay between reconnection attempts.
    pub reconnect_interval_ms: u64,
    /// Bound of the outbound message queue; producers wait when it is full.
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            reconnect_interval_ms: 1000,
            outbound_capacity: 10,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// `[machine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Heartbeat echoes per second.
    pub heartbeat_frequency_hz: u32,
    /// Period of the power-state reconciliation loop.
    pub power_state_period_ms: u64,
    /// Controller main loop tick.
    pub tick_ms: u64,
    /// Wait before re-checking when no status has been observed yet.
    pub observation_retry_ms: u64,
    /// Working control word before the first transition.
    pub initial_control_word: u16,
    /// Index of the machine object in the controller's command tree.
    pub machine_index: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            heartbeat_frequency_hz: 1,
            power_state_period_ms: 1000,
            tick_ms: 50,
            observation_retry_ms: 1000,
            initial_control_word: INITIAL_CONTROL_WORD,
            machine_index: 0,
        }
    }
}

impl MachineConfig {
    pub fn power_state_period(&self) -> Duration {
        Duration::from_millis(self.power_state_period_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn observation_retry(&self) -> Duration {
        Duration::from_millis(self.observation_retry_ms)
    }
}

/// `[stream]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Free slots required before another item is dispatched.
    pub min_capacity: i32,
    /// Period of a single-command reconciliation loop.
    pub single_period_ms: u64,
    /// Period of a batch (trajectory) reconciliation loop.
    pub batch_period_ms: u64,
    /// Controller main loop tick.
    pub tick_ms: u64,
    /// Wait before re-checking when no stream state has been observed yet.
    pub observation_retry_ms: u64,
    pub stream_index: u32,
    pub kinematics_configuration: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_capacity: DEFAULT_MIN_CAPACITY,
            single_period_ms: 500,
            batch_period_ms: 50,
            tick_ms: 50,
            observation_retry_ms: 1000,
            stream_index: 0,
            kinematics_configuration: 0,
        }
    }
}

impl StreamConfig {
    pub fn single_period(&self) -> Duration {
        Duration::from_millis(self.single_period_ms)
    }

    pub fn batch_period(&self) -> Duration {
        Duration::from_millis(self.batch_period_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn observation_retry(&self) -> Duration {
        Duration::from_millis(self.observation_retry_ms)
    }
}

/// `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Deadline applied to blocking facade calls without an explicit timeout.
    pub default_timeout_s: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            default_timeout_s: 120.0,
        }
    }
}

impl ApiConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_s)
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub shared: SharedConfig,
    pub connection: ConnectionConfig,
    pub machine: MachineConfig,
    pub stream: StreamConfig,
    pub api: ApiConfig,
}

impl ClientConfig {
    /// Check every section's bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::ValidationError(msg.to_string()))
        };

        if self.connection.url.is_empty() {
            return invalid("connection.url cannot be empty");
        }
        if self.connection.outbound_capacity == 0 {
            return invalid("connection.outbound_capacity must be > 0");
        }
        if self.connection.reconnect_interval_ms == 0 {
            return invalid("connection.reconnect_interval_ms must be > 0");
        }
        if !(1..=MAX_HEARTBEAT_HZ).contains(&self.machine.heartbeat_frequency_hz) {
            return Err(ConfigError::ValidationError(format!(
                "machine.heartbeat_frequency_hz must be in 1..={MAX_HEARTBEAT_HZ}"
            )));
        }
        if self.machine.power_state_period_ms == 0
            || self.machine.tick_ms == 0
            || self.machine.observation_retry_ms == 0
        {
            return invalid("machine periods must be > 0");
        }
        if self.stream.min_capacity <= 0 {
            return invalid("stream.min_capacity must be > 0");
        }
        if self.stream.single_period_ms == 0
            || self.stream.batch_period_ms == 0
            || self.stream.tick_ms == 0
            || self.stream.observation_retry_ms == 0
        {
            return invalid("stream periods must be > 0");
        }
        if !(self.api.default_timeout_s > 0.0 && self.api.default_timeout_s <= MAX_TIMEOUT_S) {
            return Err(ConfigError::ValidationError(format!(
                "api.default_timeout_s must be in (0, {MAX_TIMEOUT_S}]"
            )));
        }
        Ok(())
    }
}

/// Load any deserializable configuration type from a TOML file.
///
/// - `ConfigError::FileNotFound` if the file does not exist
/// - `ConfigError::ParseError` if it cannot be read or is not valid TOML
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
