//! Error types for KEEL operations

use crate::{MessageId, NodeId};
use std::time::Duration;
use thiserror::Error;

/// Durable queue errors.
///
/// Duplicate-key conflicts are deliberately absent: they are the idempotent
/// success path of the at-least-once contract and surface as outcomes, not
/// errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("No matching outgoing envelope {id} for queue {queue}")]
    NoMatchingOutgoing { queue: String, id: MessageId },

    #[error("Envelope {id} has no scheduled time")]
    MissingScheduledTime { id: MessageId },

    #[error("Invalid queue name: {name}")]
    InvalidQueueName { name: String },

    #[error("Unknown destination: {uri}")]
    UnknownDestination { uri: String },

    #[error("Envelope {id} has no destination")]
    MissingDestination { id: MessageId },

    #[error("Endpoint mode {mode} is not supported by queue {queue}")]
    UnsupportedMode { queue: String, mode: String },

    #[error("Database error during {operation}: {reason}")]
    Database { operation: String, reason: String },

    #[error("Connection pool error: {reason}")]
    Pool { reason: String },

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Schema error on {table}: {reason}")]
    Schema { table: String, reason: String },

    #[error("Session already finished")]
    SessionFinished,

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl QueueError {
    /// Logic/consistency failures that signal a lost message or an ordering
    /// bug. These must reach the caller synchronously.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            QueueError::NoMatchingOutgoing { .. } | QueueError::MissingScheduledTime { .. }
        )
    }

    /// Infrastructure failures left to the surrounding retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Database { .. } | QueueError::Pool { .. } | QueueError::Timeout { .. }
        )
    }
}

/// Envelope (de)serialization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Failed to serialize envelope {id}: {reason}")]
    Serialize { id: MessageId, reason: String },

    #[error("Failed to deserialize envelope data ({len} bytes): {reason}")]
    Deserialize { len: usize, reason: String },
}

/// Assignment protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Node {node_id} is not reachable: {reason}")]
    PeerUnavailable { node_id: NodeId, reason: String },

    #[error("Node {node_id} did not reply within {after:?}")]
    PeerTimeout { node_id: NodeId, after: Duration },

    #[error("Node {node_id} replied as {replied_as}")]
    MismatchedReply { node_id: NodeId, replied_as: NodeId },

    #[error("Invalid agent uri: {uri}")]
    InvalidAgentUri { uri: String },

    #[error("Command rejected: {reason}")]
    CommandRejected { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read configuration from {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

/// Master error type for all KEEL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KeelError {
    /// See [`QueueError::is_hard`].
    pub fn is_hard(&self) -> bool {
        matches!(self, KeelError::Queue(e) if e.is_hard())
    }
}

/// Result type alias for KEEL operations.
pub type KeelResult<T> = Result<T, KeelError>;

// =============================================================================
// TESTS
// =============================================================================
