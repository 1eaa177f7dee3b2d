//! Node registry and assignment tracker.
//!
//! Purely in-memory. The assignment map starts absent and is established once
//! the node reaches steady state; until then there is nothing to verify.

use crate::command::AgentCommand;
use keel_core::{AgentUri, NodeId, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One known cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub alive: bool,
    pub last_seen: Timestamp,
}

/// Where a single agent stands from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentState {
    Unassigned,
    AssignedLocal,
    AssignedRemote(NodeId),
    /// More than one node reported running it; awaiting a Stop/Assign pair.
    Conflicted,
}

#[derive(Debug, Clone)]
pub struct NodeTracker {
    local: NodeId,
    nodes: BTreeMap<NodeId, NodeRecord>,
    last_assignments: Option<BTreeMap<AgentUri, NodeId>>,
    conflicted: BTreeSet<AgentUri>,
}

impl NodeTracker {
    pub fn new(local: NodeId, now: Timestamp) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            local,
            NodeRecord {
                id: local,
                alive: true,
                last_seen: now,
            },
        );
        Self {
            local,
            nodes,
            last_assignments: None,
            conflicted: BTreeSet::new(),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    // ========================================================================
    // NODES
    // ========================================================================

    /// Record a sighting of `node`, marking it alive.
    pub fn node_seen(&mut self, node: NodeId, now: Timestamp) {
        self.nodes
            .entry(node)
            .and_modify(|record| {
                record.alive = true;
                record.last_seen = now;
            })
            .or_insert(NodeRecord {
                id: node,
                alive: true,
                last_seen: now,
            });
    }

    /// Refresh `last_seen` for a node that is still live. Departed nodes
    /// stay departed.
    pub fn touch(&mut self, node: NodeId, now: Timestamp) {
        if let Some(record) = self.nodes.get_mut(&node).filter(|record| record.alive) {
            record.last_seen = now;
        }
    }

    /// Mark `node` as departed. The local node cannot be marked dead.
    pub fn node_lost(&mut self, node: NodeId) {
        if node == self.local {
            return;
        }
        if let Some(record) = self.nodes.get_mut(&node) {
            record.alive = false;
        }
    }

    pub fn remove_node(&mut self, node: NodeId) -> Option<NodeRecord> {
        if node == self.local {
            return None;
        }
        self.nodes.remove(&node)
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node)
    }

    pub fn is_live(&self, node: NodeId) -> bool {
        self.nodes.get(&node).is_some_and(|record| record.alive)
    }

    /// Live peers, excluding this node, in id order.
    pub fn other_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|record| record.alive && record.id != self.local)
            .map(|record| record.id)
            .collect()
    }

    /// Every live node including this one.
    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.nodes
            .values()
            .filter(|record| record.alive)
            .map(|record| record.id)
            .collect()
    }

    // ========================================================================
    // ASSIGNMENTS
    // ========================================================================

    pub fn last_assignments(&self) -> Option<&BTreeMap<AgentUri, NodeId>> {
        self.last_assignments.as_ref()
    }

    /// Replace the assignment map wholesale, ending the warm-up period.
    pub fn establish(&mut self, assignments: BTreeMap<AgentUri, NodeId>) {
        self.conflicted.clear();
        self.last_assignments = Some(assignments);
    }

    pub fn owner_of(&self, uri: &AgentUri) -> Option<NodeId> {
        self.last_assignments.as_ref()?.get(uri).copied()
    }

    pub fn state_of(&self, uri: &AgentUri) -> AssignmentState {
        if self.conflicted.contains(uri) {
            return AssignmentState::Conflicted;
        }
        match self.owner_of(uri) {
            None => AssignmentState::Unassigned,
            Some(node) if node == self.local => AssignmentState::AssignedLocal,
            Some(node) => AssignmentState::AssignedRemote(node),
        }
    }

    /// A local agent started. Ignored before the map is established.
    pub fn agent_started(&mut self, uri: AgentUri) {
        let local = self.local;
        if let Some(assignments) = self.last_assignments.as_mut() {
            self.conflicted.remove(&uri);
            assignments.insert(uri, local);
        }
    }

    /// A local agent stopped. Only clears entries owned by this node.
    pub fn agent_stopped(&mut self, uri: &AgentUri) {
        let local = self.local;
        if let Some(assignments) = self.last_assignments.as_mut() {
            if assignments.get(uri) == Some(&local) {
                assignments.remove(uri);
            }
        }
    }

    /// Fold a cycle's observation of `uri` into the map: `owner` is the
    /// lowest live reporter out of `reporters` live nodes running it. The uri
    /// stays conflicted while more than one live node reports it.
    pub fn record_observed(&mut self, uri: &AgentUri, owner: NodeId, reporters: usize) {
        let Some(assignments) = self.last_assignments.as_mut() else {
            return;
        };
        if assignments.insert(uri.clone(), owner) != Some(owner) {
            debug!(uri = %uri, owner = %owner, "Observed owner recorded");
        }
        if reporters > 1 {
            self.conflicted.insert(uri.clone());
        } else {
            self.conflicted.remove(uri);
        }
    }

    /// Apply an executed command. Returns true when the map changed.
    pub fn apply(&mut self, command: &AgentCommand) -> bool {
        let Some(assignments) = self.last_assignments.as_mut() else {
            return false;
        };

        let changed = match command {
            AgentCommand::Assign { uri, node } => {
                let was_conflicted = self.conflicted.remove(uri);
                assignments.insert(uri.clone(), *node) != Some(*node) || was_conflicted
            }
            AgentCommand::Stop { uri, node } => {
                if assignments.get(uri) == Some(node) {
                    assignments.remove(uri);
                    self.conflicted.remove(uri);
                    true
                } else {
                    // A stopped loser leaves the recorded winner in place.
                    assignments.contains_key(uri) && self.conflicted.remove(uri)
                }
            }
            AgentCommand::NoOp => false,
        };

        if changed {
            debug!(command = %command, "Assignment updated");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn node(n: u128) -> NodeId {
        NodeId::from_uuid(Uuid::from_u128(n))
    }

    fn uri(s: &str) -> AgentUri {
        AgentUri::parse(s).unwrap()
    }

    #[test]
    fn test_other_nodes_excludes_local_and_dead() {
        let now = Utc::now();
        let mut tracker = NodeTracker::new(node(1), now);
        tracker.node_seen(node(3), now);
        tracker.node_seen(node(2), now);
        tracker.node_seen(node(4), now);
        tracker.node_lost(node(4));

        assert_eq!(tracker.other_nodes(), vec![node(2), node(3)]);
        assert_eq!(tracker.live_nodes().len(), 3);
    }

    #[test]
    fn test_local_node_stays_alive() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.node_lost(node(1));
        assert!(tracker.is_live(node(1)));
        assert!(tracker.remove_node(node(1)).is_none());
    }

    #[test]
    fn test_local_events_ignored_before_establish() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.agent_started(uri("a://one"));
        assert!(tracker.last_assignments().is_none());
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::Unassigned);
    }

    #[test]
    fn test_local_start_and_stop() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.establish(BTreeMap::new());

        tracker.agent_started(uri("a://one"));
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::AssignedLocal);

        tracker.agent_stopped(&uri("a://one"));
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::Unassigned);
    }

    #[test]
    fn test_local_stop_keeps_remote_owner() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.establish(BTreeMap::from([(uri("a://one"), node(2))]));
        tracker.agent_stopped(&uri("a://one"));
        assert_eq!(tracker.owner_of(&uri("a://one")), Some(node(2)));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.establish(BTreeMap::new());
        let assign = AgentCommand::Assign {
            uri: uri("a://one"),
            node: node(2),
        };
        assert!(tracker.apply(&assign));
        assert!(!tracker.apply(&assign));
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::AssignedRemote(node(2)));

        let stop_other = AgentCommand::Stop {
            uri: uri("a://one"),
            node: node(3),
        };
        assert!(!tracker.apply(&stop_other));
        assert!(!tracker.apply(&AgentCommand::NoOp));
    }

    #[test]
    fn test_touch_does_not_revive_departed_node() {
        let start = Utc::now();
        let later = start + chrono::Duration::seconds(5);
        let mut tracker = NodeTracker::new(node(1), start);
        tracker.node_seen(node(2), start);
        tracker.node_seen(node(3), start);
        tracker.node_lost(node(3));

        tracker.touch(node(2), later);
        tracker.touch(node(3), later);
        tracker.touch(node(9), later);

        assert_eq!(tracker.node(node(2)).unwrap().last_seen, later);
        assert!(!tracker.is_live(node(3)));
        assert_eq!(tracker.node(node(3)).unwrap().last_seen, start);
        assert!(tracker.node(node(9)).is_none());
    }

    #[test]
    fn test_record_observed_replaces_stale_owner() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.record_observed(&uri("a://one"), node(3), 1);
        assert!(tracker.last_assignments().is_none());

        tracker.establish(BTreeMap::from([(uri("a://one"), node(2))]));
        tracker.record_observed(&uri("a://one"), node(3), 1);
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::AssignedRemote(node(3)));
    }

    #[test]
    fn test_conflict_clears_once_single_reporter_remains() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.establish(BTreeMap::from([(uri("a://one"), node(2))]));

        tracker.record_observed(&uri("a://one"), node(2), 2);
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::Conflicted);

        tracker.record_observed(&uri("a://one"), node(2), 1);
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::AssignedRemote(node(2)));
    }

    #[test]
    fn test_stopping_loser_resolves_conflict() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.establish(BTreeMap::new());
        tracker.record_observed(&uri("a://one"), node(2), 2);

        assert!(tracker.apply(&AgentCommand::Stop {
            uri: uri("a://one"),
            node: node(3),
        }));
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::AssignedRemote(node(2)));
        assert!(!tracker.apply(&AgentCommand::Stop {
            uri: uri("a://one"),
            node: node(3),
        }));
    }

    #[test]
    fn test_assign_resolves_conflict() {
        let mut tracker = NodeTracker::new(node(1), Utc::now());
        tracker.establish(BTreeMap::from([(uri("a://one"), node(2))]));
        tracker.record_observed(&uri("a://one"), node(2), 2);
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::Conflicted);

        assert!(tracker.apply(&AgentCommand::Assign {
            uri: uri("a://one"),
            node: node(2),
        }));
        assert_eq!(tracker.state_of(&uri("a://one")), AssignmentState::AssignedRemote(node(2)));
    }
}
