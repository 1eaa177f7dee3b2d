//! Inter-node agent queries.
//!
//! Peers are addressed by [`NodeId`] and reached through message passing.
//! [`ChannelMesh`] is the in-process implementation: every registered node
//! gets a request channel served by its own responder task.

use async_trait::async_trait;
use keel_core::{AgentError, AgentUri, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ============================================================================
// MESSAGES
// ============================================================================

/// Request for the set of agents a node is running. Carries no payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAgents;

/// Reply to [`QueryAgents`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningAgents {
    pub node_id: NodeId,
    pub agents: Vec<AgentUri>,
}

impl QueryAgents {
    /// Answer from the local running set.
    pub fn execute(&self, local: &dyn LocalAgents) -> RunningAgents {
        RunningAgents {
            node_id: local.node_id(),
            agents: local.running_agents(),
        }
    }
}

// ============================================================================
// LOCAL AGENTS
// ============================================================================

/// This node's view of the agents it is running.
///
/// Must answer immediately; it is called from the responder path.
pub trait LocalAgents: Send + Sync {
    fn node_id(&self) -> NodeId;
    fn running_agents(&self) -> Vec<AgentUri>;
}

/// Mutable running set for one node.
#[derive(Debug)]
pub struct LocalAgentSet {
    node_id: NodeId,
    running: Mutex<BTreeSet<AgentUri>>,
}

impl LocalAgentSet {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            running: Mutex::new(BTreeSet::new()),
        }
    }

    /// Returns false if it was already running.
    pub fn start(&self, uri: AgentUri) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(uri)
    }

    /// Returns false if it was not running.
    pub fn stop(&self, uri: &AgentUri) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(uri)
    }

    pub fn is_running(&self, uri: &AgentUri) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(uri)
    }
}

impl LocalAgents for LocalAgentSet {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn running_agents(&self) -> Vec<AgentUri> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

// ============================================================================
// NODE TRANSPORT
// ============================================================================

/// Request/reply channel to peer nodes.
///
/// Timeouts are applied by the caller.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn query_agents(&self, node: NodeId) -> Result<RunningAgents, AgentError>;
}

// ============================================================================
// CHANNEL MESH
// ============================================================================

struct PeerRequest {
    query: QueryAgents,
    reply: oneshot::Sender<RunningAgents>,
}

/// In-process mesh of node endpoints.
#[derive(Clone, Default)]
pub struct ChannelMesh {
    endpoints: Arc<RwLock<HashMap<NodeId, mpsc::Sender<PeerRequest>>>>,
}

impl std::fmt::Debug for ChannelMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMesh")
            .field("nodes", &self.nodes().len())
            .finish()
    }
}

const ENDPOINT_CAPACITY: usize = 32;

impl ChannelMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `local` on the mesh. The responder task ends when the node is
    /// unregistered and in-flight requests drain.
    pub fn register(&self, local: Arc<dyn LocalAgents>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<PeerRequest>(ENDPOINT_CAPACITY);
        let node_id = local.node_id();
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node_id, tx);

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let reply = request.query.execute(local.as_ref());
                if request.reply.send(reply).is_err() {
                    debug!(node = %node_id, "Requester went away before reply");
                }
            }
            debug!(node = %node_id, "Node endpoint closed");
        })
    }

    pub fn unregister(&self, node: NodeId) -> bool {
        self.endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&node)
            .is_some()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        nodes.sort();
        nodes
    }

    fn endpoint(&self, node: NodeId) -> Option<mpsc::Sender<PeerRequest>> {
        self.endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&node)
            .cloned()
    }
}

#[async_trait]
impl NodeTransport for ChannelMesh {
    async fn query_agents(&self, node: NodeId) -> Result<RunningAgents, AgentError> {
        let endpoint = self.endpoint(node).ok_or_else(|| AgentError::PeerUnavailable {
            node_id: node,
            reason: "not registered".to_string(),
        })?;

        let (reply, response) = oneshot::channel();
        endpoint
            .send(PeerRequest {
                query: QueryAgents,
                reply,
            })
            .await
            .map_err(|_| {
                warn!(node = %node, "Node endpoint closed");
                AgentError::PeerUnavailable {
                    node_id: node,
                    reason: "endpoint closed".to_string(),
                }
            })?;

        response.await.map_err(|_| AgentError::PeerUnavailable {
            node_id: node,
            reason: "no reply".to_string(),
        })
    }
}
