//! Reconciliation commands.

use keel_core::{AgentUri, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Corrective action for the agent-lifecycle collaborator.
///
/// Applying a command that already matches the current state is a no-op, so
/// commands from concurrent verification cycles on different nodes are safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Run `uri` on `node`.
    Assign { uri: AgentUri, node: NodeId },
    /// Stop `uri` on `node`.
    Stop { uri: AgentUri, node: NodeId },
    /// Nothing to do.
    NoOp,
}

impl AgentCommand {
    pub fn uri(&self) -> Option<&AgentUri> {
        match self {
            AgentCommand::Assign { uri, .. } | AgentCommand::Stop { uri, .. } => Some(uri),
            AgentCommand::NoOp => None,
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            AgentCommand::Assign { node, .. } | AgentCommand::Stop { node, .. } => Some(*node),
            AgentCommand::NoOp => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, AgentCommand::NoOp)
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCommand::Assign { uri, node } => write!(f, "assign {} to {}", uri, node),
            AgentCommand::Stop { uri, node } => write!(f, "stop {} on {}", uri, node),
            AgentCommand::NoOp => f.write_str("no-op"),
        }
    }
}
