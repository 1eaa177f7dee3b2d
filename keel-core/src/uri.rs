//! Queue and agent addressing.
//!
//! Queues are addressed as `<protocol>://<queue-name>`. Queue names double as
//! table-name fragments, so they are restricted to SQL identifiers.

use crate::error::{AgentError, QueueError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is valid")
});

static AGENT_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9+.\-]*://\S+$").expect("agent uri pattern is valid")
});

/// True when `value` can be interpolated into SQL as an unquoted identifier.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

// ============================================================================
// QUEUE URI
// ============================================================================

/// Address of a named durable queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueUri {
    protocol: String,
    name: String,
}

impl QueueUri {
    /// Build a queue uri, validating the queue name.
    pub fn new(protocol: &str, name: &str) -> Result<Self, QueueError> {
        if !is_valid_identifier(name) {
            return Err(QueueError::InvalidQueueName {
                name: name.to_string(),
            });
        }
        Ok(Self {
            protocol: protocol.to_string(),
            name: name.to_string(),
        })
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.name)
    }
}

impl FromStr for QueueUri {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, name) = s.split_once("://").ok_or_else(|| QueueError::InvalidQueueName {
            name: s.to_string(),
        })?;
        QueueUri::new(protocol, name.trim_end_matches('/'))
    }
}

impl TryFrom<String> for QueueUri {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QueueUri> for String {
    fn from(uri: QueueUri) -> Self {
        uri.to_string()
    }
}

// ============================================================================
// AGENT URI
// ============================================================================

/// Address of a long-running agent, e.g. `projections://orders/summary`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentUri(String);

impl AgentUri {
    pub fn parse(value: &str) -> Result<Self, AgentError> {
        if AGENT_URI.is_match(value) {
            Ok(AgentUri(value.to_string()))
        } else {
            Err(AgentError::InvalidAgentUri {
                uri: value.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scheme identifies the agent family that owns this uri.
    pub fn scheme(&self) -> &str {
        self.0.split("://").next().unwrap_or_default()
    }
}

impl fmt::Display for AgentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentUri {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentUri::parse(s)
    }
}

impl TryFrom<String> for AgentUri {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AgentUri::parse(&value)
    }
}

impl From<AgentUri> for String {
    fn from(uri: AgentUri) -> Self {
        uri.0
    }
}
