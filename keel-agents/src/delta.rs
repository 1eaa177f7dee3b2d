//! Expected versus observed agent ownership.
//!
//! [`find_delta`] is pure: every input is a snapshot, so the commands it
//! returns depend only on the set of replies and never on their arrival
//! order.

use crate::command::AgentCommand;
use keel_core::{AgentUri, NodeId};
use std::collections::{BTreeMap, BTreeSet};

/// Merged replies from one verification cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedAssignments {
    reporters: BTreeMap<AgentUri, BTreeSet<NodeId>>,
    responded: BTreeSet<NodeId>,
}

impl ObservedAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` answered and is running `agents`.
    pub fn record<'a>(&mut self, node: NodeId, agents: impl IntoIterator<Item = &'a AgentUri>) {
        self.responded.insert(node);
        for uri in agents {
            self.reporters.entry(uri.clone()).or_default().insert(node);
        }
    }

    pub fn responded(&self) -> &BTreeSet<NodeId> {
        &self.responded
    }

    pub fn has_responded(&self, node: NodeId) -> bool {
        self.responded.contains(&node)
    }

    /// Nodes reporting `uri`, in id order.
    pub fn reporters(&self, uri: &AgentUri) -> Option<&BTreeSet<NodeId>> {
        self.reporters.get(uri)
    }

    pub fn uris(&self) -> impl Iterator<Item = &AgentUri> {
        self.reporters.keys()
    }

    /// Single-owner view: the lowest reporting node per uri.
    pub fn owners(&self) -> BTreeMap<AgentUri, NodeId> {
        self.reporters
            .iter()
            .filter_map(|(uri, nodes)| nodes.first().map(|node| (uri.clone(), *node)))
            .collect()
    }
}

/// Commands that bring the cluster in line with what was observed.
///
/// Per uri, in uri order:
/// - reported by a node that is no longer live: `Stop` on that node
/// - reported by several live nodes: the lowest node id wins, every other
///   reporter gets a `Stop`
/// - live winner differs from the expected owner: `Assign` to the winner
/// - expected but not reported, owner answered: `Assign` back to the owner
/// - expected but not reported, owner no longer live: `Assign` to a live
///   node picked from the uri
/// - expected but not reported, owner live and silent: nothing this cycle
pub fn find_delta(
    expected: &BTreeMap<AgentUri, NodeId>,
    observed: &ObservedAssignments,
    live: &BTreeSet<NodeId>,
) -> Vec<AgentCommand> {
    let uris: BTreeSet<&AgentUri> = expected.keys().chain(observed.uris()).collect();
    let mut commands = Vec::new();

    for uri in uris {
        let owner = expected.get(uri).copied();
        let reporters = observed.reporters(uri);

        let (running, departed): (Vec<NodeId>, Vec<NodeId>) = reporters
            .map(|nodes| nodes.iter().copied().partition(|node| live.contains(node)))
            .unwrap_or_default();

        for node in departed {
            commands.push(AgentCommand::Stop {
                uri: uri.clone(),
                node,
            });
        }

        if let Some((&winner, losers)) = running.split_first() {
            for &node in losers {
                commands.push(AgentCommand::Stop {
                    uri: uri.clone(),
                    node,
                });
            }
            if owner != Some(winner) {
                commands.push(AgentCommand::Assign {
                    uri: uri.clone(),
                    node: winner,
                });
            }
            continue;
        }

        let Some(owner) = owner else {
            continue;
        };

        if observed.has_responded(owner) && live.contains(&owner) {
            commands.push(AgentCommand::Assign {
                uri: uri.clone(),
                node: owner,
            });
        } else if !live.contains(&owner) {
            if let Some(node) = pick_node(uri, live) {
                commands.push(AgentCommand::Assign {
                    uri: uri.clone(),
                    node,
                });
            }
        }
    }

    commands
}

/// Stable choice of a live node for `uri`, identical on every node that
/// shares the same live set.
fn pick_node(uri: &AgentUri, live: &BTreeSet<NodeId>) -> Option<NodeId> {
    if live.is_empty() {
        return None;
    }
    let index = (fnv1a(uri.as_str().as_bytes()) % live.len() as u64) as usize;
    live.iter().nth(index).copied()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
