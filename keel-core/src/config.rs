//! Configuration types
//!
//! Every section has production defaults, a `development()` preset with short
//! intervals, and a `from_env()` constructor. The whole tree can also be read
//! from a TOML document; missing keys fall back to defaults.

use crate::error::ConfigError;
use crate::uri::is_valid_identifier;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default number of messages pulled per listener batch.
pub const DEFAULT_MAXIMUM_MESSAGES_TO_RECEIVE: i64 = 20;

/// Protocol segment of Postgres-backed queue uris.
pub const POSTGRES_PROTOCOL: &str = "postgresql";

// ============================================================================
// ENDPOINT MODE
// ============================================================================

/// How a listener consumes a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointMode {
    /// Pop into the node-owned inbox before processing
    Durable,
    /// Pop straight out of the ready table
    BufferedInMemory,
    /// Process on the caller's task without buffering
    Inline,
}

impl FromStr for EndpointMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "durable" => Ok(EndpointMode::Durable),
            "buffered" | "bufferedinmemory" | "buffered_in_memory" => {
                Ok(EndpointMode::BufferedInMemory)
            }
            "inline" => Ok(EndpointMode::Inline),
            _ => Err(ConfigError::InvalidValue {
                field: "mode".to_string(),
                value: s.to_string(),
                reason: "expected durable, buffered or inline".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EndpointMode::Durable => "Durable",
            EndpointMode::BufferedInMemory => "BufferedInMemory",
            EndpointMode::Inline => "Inline",
        };
        f.write_str(name)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Queue transport settings shared by every queue of one transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Schema holding queue, outgoing and inbox tables
    pub schema_name: String,
    /// Queue tables are named `<prefix>_<queue>` and `<prefix>_<queue>_scheduled`
    pub table_prefix: String,
    /// Create missing tables during `initialize`
    pub auto_provision: bool,
    /// Delete every row during `initialize`
    pub auto_purge_all_queues: bool,
    /// Listener batch size
    pub maximum_messages_to_receive: i64,
    pub mode: EndpointMode,
    /// Upper bound on any single store operation
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            schema_name: "keel".to_string(),
            table_prefix: "keel_queue".to_string(),
            auto_provision: true,
            auto_purge_all_queues: false,
            maximum_messages_to_receive: DEFAULT_MAXIMUM_MESSAGES_TO_RECEIVE,
            mode: EndpointMode::Durable,
            operation_timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Create TransportConfig from environment variables.
    ///
    /// - `KEEL_SCHEMA` (default: keel)
    /// - `KEEL_TABLE_PREFIX` (default: keel_queue)
    /// - `KEEL_AUTO_PROVISION` (default: true)
    /// - `KEEL_AUTO_PURGE` (default: false)
    /// - `KEEL_MAX_MESSAGES_TO_RECEIVE` (default: 20)
    /// - `KEEL_ENDPOINT_MODE` (default: durable)
    /// - `KEEL_OPERATION_TIMEOUT_MS` (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            schema_name: std::env::var("KEEL_SCHEMA").unwrap_or(defaults.schema_name),
            table_prefix: std::env::var("KEEL_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
            auto_provision: env_bool("KEEL_AUTO_PROVISION", defaults.auto_provision),
            auto_purge_all_queues: env_bool("KEEL_AUTO_PURGE", defaults.auto_purge_all_queues),
            maximum_messages_to_receive: env_parse(
                "KEEL_MAX_MESSAGES_TO_RECEIVE",
                defaults.maximum_messages_to_receive,
            ),
            mode: env_parse("KEEL_ENDPOINT_MODE", defaults.mode),
            operation_timeout: Duration::from_millis(env_parse(
                "KEEL_OPERATION_TIMEOUT_MS",
                defaults.operation_timeout.as_millis() as u64,
            )),
        }
    }

    /// Configuration for local development: provision and purge on start.
    pub fn development() -> Self {
        Self {
            auto_purge_all_queues: true,
            operation_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("schema_name", &self.schema_name),
            ("table_prefix", &self.table_prefix),
        ] {
            if !is_valid_identifier(value) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.clone(),
                    reason: "must be a SQL identifier".to_string(),
                });
            }
        }
        if self.maximum_messages_to_receive <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "maximum_messages_to_receive".to_string(),
                value: self.maximum_messages_to_receive.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        require_non_zero("operation_timeout", self.operation_timeout)
    }
}

// ============================================================================
// DURABILITY AGENT
// ============================================================================

/// Background sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurabilityConfig {
    /// How often due scheduled rows are promoted
    #[serde(with = "duration_ms")]
    pub scheduled_poll_interval: Duration,
    /// How often expired rows are deleted
    #[serde(with = "duration_ms")]
    pub expired_cleanup_interval: Duration,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            scheduled_poll_interval: Duration::from_secs(5),
            expired_cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl DurabilityConfig {
    /// - `KEEL_SCHEDULED_POLL_SECS` (default: 5)
    /// - `KEEL_EXPIRED_CLEANUP_SECS` (default: 300)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scheduled_poll_interval: Duration::from_secs(env_parse(
                "KEEL_SCHEDULED_POLL_SECS",
                defaults.scheduled_poll_interval.as_secs(),
            )),
            expired_cleanup_interval: Duration::from_secs(env_parse(
                "KEEL_EXPIRED_CLEANUP_SECS",
                defaults.expired_cleanup_interval.as_secs(),
            )),
        }
    }

    pub fn development() -> Self {
        Self {
            scheduled_poll_interval: Duration::from_secs(1),
            expired_cleanup_interval: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_zero("scheduled_poll_interval", self.scheduled_poll_interval)?;
        require_non_zero("expired_cleanup_interval", self.expired_cleanup_interval)
    }
}

// ============================================================================
// ASSIGNMENT VERIFIER
// ============================================================================

/// Assignment verification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Time between verification cycles
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Budget for a single peer's `QueryAgents` reply
    #[serde(with = "duration_ms")]
    pub peer_timeout: Duration,
    /// A last check older than this many intervals reports as degraded
    pub stale_after_intervals: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            peer_timeout: Duration::from_secs(5),
            stale_after_intervals: 3,
        }
    }
}

impl VerifierConfig {
    /// - `KEEL_VERIFY_INTERVAL_SECS` (default: 30)
    /// - `KEEL_PEER_TIMEOUT_MS` (default: 5000)
    /// - `KEEL_VERIFY_STALE_AFTER` (default: 3)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            check_interval: Duration::from_secs(env_parse(
                "KEEL_VERIFY_INTERVAL_SECS",
                defaults.check_interval.as_secs(),
            )),
            peer_timeout: Duration::from_millis(env_parse(
                "KEEL_PEER_TIMEOUT_MS",
                defaults.peer_timeout.as_millis() as u64,
            )),
            stale_after_intervals: env_parse(
                "KEEL_VERIFY_STALE_AFTER",
                defaults.stale_after_intervals,
            ),
        }
    }

    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_secs(2),
            peer_timeout: Duration::from_millis(500),
            stale_after_intervals: 3,
        }
    }

    /// Age past which the last completed cycle counts as stale.
    pub fn staleness_threshold(&self) -> Duration {
        self.check_interval * self.stale_after_intervals.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_non_zero("check_interval", self.check_interval)?;
        require_non_zero("peer_timeout", self.peer_timeout)
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub transport: TransportConfig,
    pub durability: DurabilityConfig,
    pub verifier: VerifierConfig,
}

impl KeelConfig {
    pub fn from_env() -> Self {
        Self {
            transport: TransportConfig::from_env(),
            durability: DurabilityConfig::from_env(),
            verifier: VerifierConfig::from_env(),
        }
    }

    pub fn development() -> Self {
        Self {
            transport: TransportConfig::development(),
            durability: DurabilityConfig::development(),
            verifier: VerifierConfig::development(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: KeelConfig = toml::from_str(source).map_err(|e| ConfigError::InvalidValue {
            field: "<toml>".to_string(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.durability.validate()?;
        self.verifier.validate()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn require_non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Durations as integer milliseconds in TOML/JSON.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
