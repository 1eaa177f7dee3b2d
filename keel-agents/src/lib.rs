//! KEEL Agents - Assignment Tracking and Verification
//!
//! Every node keeps its own view of which node runs which agent. A periodic
//! verification cycle asks every live peer what it is actually running,
//! compares the answers with that view and emits corrective commands:
//! - `command`: the reconciliation vocabulary (`Assign`, `Stop`, `NoOp`)
//! - `tracker`: node registry and the agent-uri to node-id assignment map
//! - `delta`: pure comparison of expected and observed ownership
//! - `transport`: the `QueryAgents` / `RunningAgents` exchange and an
//!   in-process channel mesh
//! - `verifier`: one verification cycle
//! - `jobs`: the periodic driver and its health report

pub mod command;
pub mod delta;
pub mod jobs;
pub mod tracker;
pub mod transport;
pub mod verifier;

pub use command::AgentCommand;
pub use delta::{find_delta, ObservedAssignments};
pub use jobs::{run_cycle, verification_task, CommandSink, VerificationMetrics, VerificationSnapshot};
pub use tracker::{AssignmentState, NodeRecord, NodeTracker};
pub use transport::{
    ChannelMesh, LocalAgentSet, LocalAgents, NodeTransport, QueryAgents, RunningAgents,
};
pub use verifier::{verifier_health, AssignmentVerifier, PeerFailure, VerificationOutcome};
