//! KEEL Core - Shared Types
//!
//! Pure data structures shared by the queue engine and the assignment
//! protocol. All other crates depend on this.

pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod health;
pub mod serializer;
pub mod uri;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DurabilityConfig, EndpointMode, KeelConfig, TransportConfig, VerifierConfig,
    DEFAULT_MAXIMUM_MESSAGES_TO_RECEIVE, POSTGRES_PROTOCOL,
};
pub use envelope::{Envelope, PING_MESSAGE_TYPE};
pub use error::{AgentError, ConfigError, KeelError, KeelResult, QueueError, SerializationError};
pub use health::{HealthCheck, HealthStatus};
pub use serializer::{EnvelopeSerializer, JsonEnvelopeSerializer};
pub use uri::{is_valid_identifier, AgentUri, QueueUri};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Message identifier using UUIDv7 for timestamp-sortable IDs.
pub type MessageId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 message id.
pub fn new_message_id() -> MessageId {
    Uuid::now_v7()
}

/// Identity of a cluster node.
///
/// Ordering is meaningful: ownership conflicts are settled in favour of the
/// lowest live node id, so every node reaches the same verdict locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh node id.
    pub fn new() -> Self {
        NodeId(Uuid::now_v7())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(id: Uuid) -> Self {
        NodeId(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(NodeId)
    }
}

impl From<Uuid> for NodeId {
    fn from(id: Uuid) -> Self {
        NodeId(id)
    }
}

// ============================================================================
// TESTS
// ============================================================================
