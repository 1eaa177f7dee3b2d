//! Assignment verification cycle.

use crate::command::AgentCommand;
use crate::delta::{find_delta, ObservedAssignments};
use crate::tracker::NodeTracker;
use crate::transport::{LocalAgents, NodeTransport, QueryAgents, RunningAgents};
use futures_util::future::join_all;
use keel_core::{AgentError, Clock, HealthCheck, NodeId, Timestamp, VerifierConfig};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A peer excluded from one cycle's observed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    pub node_id: NodeId,
    pub error: AgentError,
}

/// Result of one completed cycle.
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub commands: Vec<AgentCommand>,
    pub observed: ObservedAssignments,
    pub failures: Vec<PeerFailure>,
    pub completed_at: Timestamp,
}

impl VerificationOutcome {
    pub fn is_converged(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands one at a time. No peer I/O happens while iterating.
    pub fn into_commands(self) -> std::vec::IntoIter<AgentCommand> {
        self.commands.into_iter()
    }
}

/// Runs verification for one node.
pub struct AssignmentVerifier {
    tracker: Arc<RwLock<NodeTracker>>,
    transport: Arc<dyn NodeTransport>,
    local: Arc<dyn LocalAgents>,
    clock: Arc<dyn Clock>,
    peer_timeout: Duration,
    last_check: Mutex<Option<Timestamp>>,
}

impl std::fmt::Debug for AssignmentVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentVerifier")
            .field("node", &self.local.node_id())
            .field("peer_timeout", &self.peer_timeout)
            .finish_non_exhaustive()
    }
}

impl AssignmentVerifier {
    pub fn new(
        tracker: Arc<RwLock<NodeTracker>>,
        transport: Arc<dyn NodeTransport>,
        local: Arc<dyn LocalAgents>,
        clock: Arc<dyn Clock>,
        config: &VerifierConfig,
    ) -> Self {
        Self {
            tracker,
            transport,
            local,
            clock,
            peer_timeout: config.peer_timeout,
            last_check: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &Arc<RwLock<NodeTracker>> {
        &self.tracker
    }

    /// When the last cycle completed.
    pub fn last_check(&self) -> Option<Timestamp> {
        *self.last_check.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one cycle.
    ///
    /// Returns `None` while the tracker has no assignment map yet. Peers that
    /// fail or time out are reported in the outcome and left out of the
    /// observed view.
    pub async fn verify(&self) -> Option<VerificationOutcome> {
        let (expected, peers) = {
            let tracker = self.tracker.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            let expected = tracker.last_assignments()?.clone();
            (expected, tracker.other_nodes())
        };

        let replies = join_all(peers.iter().map(|&node| self.query(node))).await;

        let mut observed = ObservedAssignments::new();
        let local = QueryAgents.execute(self.local.as_ref());
        observed.record(local.node_id, &local.agents);

        let mut failures = Vec::new();
        for (node, reply) in peers.into_iter().zip(replies) {
            match reply {
                Ok(running) => observed.record(node, &running.agents),
                Err(error) => {
                    warn!(node = %node, error = %error, "Peer excluded from verification");
                    failures.push(PeerFailure {
                        node_id: node,
                        error,
                    });
                }
            }
        }

        let completed_at = self.clock.now();

        // Membership may have changed during the fan-out; judge against the
        // current live set.
        let commands = {
            let mut tracker = self.tracker.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let live = tracker.live_nodes();
            for node in observed.responded() {
                tracker.touch(*node, completed_at);
            }

            let commands = find_delta(&expected, &observed, &live);
            for uri in observed.uris() {
                let running: Vec<NodeId> = observed
                    .reporters(uri)
                    .into_iter()
                    .flatten()
                    .copied()
                    .filter(|node| live.contains(node))
                    .collect();
                if let Some(&owner) = running.first() {
                    tracker.record_observed(uri, owner, running.len());
                }
            }
            commands
        };

        *self.last_check.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(completed_at);

        if commands.is_empty() {
            debug!(peers = observed.responded().len(), "Assignments verified");
        } else {
            info!(
                commands = commands.len(),
                failures = failures.len(),
                "Assignment drift detected"
            );
        }

        Some(VerificationOutcome {
            commands,
            observed,
            failures,
            completed_at,
        })
    }

    async fn query(&self, node: NodeId) -> Result<RunningAgents, AgentError> {
        let reply = tokio::time::timeout(self.peer_timeout, self.transport.query_agents(node))
            .await
            .map_err(|_| AgentError::PeerTimeout {
                node_id: node,
                after: self.peer_timeout,
            })??;

        if reply.node_id != node {
            return Err(AgentError::MismatchedReply {
                node_id: node,
                replied_as: reply.node_id,
            });
        }
        Ok(reply)
    }

    /// Health derived from the age of the last completed cycle.
    pub fn health(&self, config: &VerifierConfig) -> HealthCheck {
        verifier_health(self.last_check(), self.clock.now(), config)
    }
}

/// Healthy while cycles keep completing, degraded once the last one is older
/// than the staleness threshold, unknown before the first.
pub fn verifier_health(
    last_check: Option<Timestamp>,
    now: Timestamp,
    config: &VerifierConfig,
) -> HealthCheck {
    const COMPONENT: &str = "assignment_verifier";

    let Some(last_check) = last_check else {
        return HealthCheck::unknown(COMPONENT, "no verification cycle completed yet");
    };

    let age = (now - last_check).to_std().unwrap_or_default();
    let check = if age > config.staleness_threshold() {
        HealthCheck::degraded(
            COMPONENT,
            format!("last verification completed {}s ago", age.as_secs()),
        )
    } else {
        HealthCheck::healthy(COMPONENT)
    };
    check.with_metadata("last_check", serde_json::json!(last_check.to_rfc3339()))
}
