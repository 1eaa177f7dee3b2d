//! KEEL Test Utilities
//!
//! Shared test infrastructure for the KEEL workspace:
//! - Proptest generators for envelopes, node ids, agent uris and queue names
//! - Fixtures for in-memory transports on a manual clock
//! - Fakes for the peer transport and the command sink
//! - Assertions for queue error classes

pub use keel_core::{
    AgentError, AgentUri, Clock, Envelope, KeelError, ManualClock, NodeId, QueueError, QueueUri,
    Timestamp, TransportConfig,
};

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::{TimeZone, Utc};
    use keel_agents::AgentCommand;
    use proptest::prelude::*;
    use uuid::Uuid;

    // === Identity Generators ===

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<u128>().prop_map(Uuid::from_u128)
    }

    /// Generate a NodeId.
    pub fn arb_node_id() -> impl Strategy<Value = NodeId> {
        arb_uuid().prop_map(NodeId::from_uuid)
    }

    /// Generate an AgentUri such as `projections://orders7`.
    pub fn arb_agent_uri() -> impl Strategy<Value = AgentUri> {
        ("[a-z][a-z0-9]{0,8}", "[a-z0-9]{1,12}(/[a-z0-9]{1,6})?")
            .prop_filter_map("valid agent uri", |(scheme, path)| {
                AgentUri::parse(&format!("{}://{}", scheme, path)).ok()
            })
    }

    /// Generate a queue name usable as a table-name fragment.
    pub fn arb_queue_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,20}"
    }

    /// Generate a timestamp between 2020 and 2035.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800i64..2_051_222_400i64)
            .prop_filter_map("valid timestamp", |secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn arb_message_type() -> impl Strategy<Value = String> {
        "[A-Z][A-Za-z]{2,16}(\\.[A-Z][A-Za-z]{2,12})?"
    }

    // === Envelope Generators ===

    /// Generate an envelope with no timing metadata and no destination.
    pub fn arb_envelope() -> impl Strategy<Value = Envelope> {
        (
            arb_uuid(),
            arb_message_type(),
            prop::collection::vec(any::<u8>(), 0..256),
        )
            .prop_map(|(id, message_type, data)| Envelope::new(message_type, data).with_id(id))
    }

    /// Generate an envelope addressed to `destination`.
    pub fn arb_envelope_for(destination: QueueUri) -> impl Strategy<Value = Envelope> {
        arb_envelope().prop_map(move |envelope| envelope.with_destination(destination.clone()))
    }

    /// Generate `count` envelopes with distinct ids.
    pub fn arb_distinct_envelopes(count: std::ops::Range<usize>) -> impl Strategy<Value = Vec<Envelope>> {
        prop::collection::btree_map(arb_uuid(), arb_envelope(), count).prop_map(|by_id| {
            by_id
                .into_iter()
                .map(|(id, envelope)| envelope.with_id(id))
                .collect()
        })
    }

    // === Command Generators ===

    pub fn arb_agent_command() -> impl Strategy<Value = AgentCommand> {
        prop_oneof![
            (arb_agent_uri(), arb_node_id()).prop_map(|(uri, node)| AgentCommand::Assign { uri, node }),
            (arb_agent_uri(), arb_node_id()).prop_map(|(uri, node)| AgentCommand::Stop { uri, node }),
            Just(AgentCommand::NoOp),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use chrono::{TimeZone, Utc};
    use keel_storage::{InMemoryEnvelopeStore, InMemoryQueue, InMemoryTransport, QueueAdmin, MEMORY_PROTOCOL};
    use keel_core::JsonEnvelopeSerializer;
    use std::sync::Arc;

    /// Fixed starting instant for manual clocks.
    pub fn base_time() -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn manual_clock() -> ManualClock {
        ManualClock::new(base_time())
    }

    /// Development transport config: no purge, auto provision.
    pub fn test_transport_config() -> TransportConfig {
        TransportConfig {
            auto_provision: true,
            auto_purge_all_queues: false,
            ..TransportConfig::development()
        }
    }

    /// In-memory transport reading time from `clock`.
    pub fn memory_transport(clock: &ManualClock) -> Arc<InMemoryTransport> {
        let store = Arc::new(InMemoryEnvelopeStore::new(
            Arc::new(JsonEnvelopeSerializer),
            Arc::new(clock.clone()),
        ));
        Arc::new(InMemoryTransport::new(store, test_transport_config()))
    }

    /// Create and set up a queue on `transport`.
    pub async fn memory_queue(transport: &InMemoryTransport, name: &str) -> Arc<InMemoryQueue> {
        let queue = transport.queue(name).unwrap();
        queue.setup().await.unwrap();
        queue
    }

    pub fn memory_uri(name: &str) -> QueueUri {
        QueueUri::new(MEMORY_PROTOCOL, name).unwrap()
    }

    pub fn ready_envelope(destination: QueueUri) -> Envelope {
        Envelope::new("Test.Message", b"{}".to_vec()).with_destination(destination)
    }

    pub fn scheduled_envelope(destination: QueueUri, at: Timestamp) -> Envelope {
        ready_envelope(destination).with_scheduled_time(at)
    }

    pub fn expiring_envelope(destination: QueueUri, keep_until: Timestamp) -> Envelope {
        ready_envelope(destination).with_keep_until(keep_until)
    }

    pub fn agent_uri(value: &str) -> AgentUri {
        AgentUri::parse(value).unwrap()
    }

    pub fn node(n: u128) -> NodeId {
        NodeId::from_uuid(uuid::Uuid::from_u128(n))
    }
}

// ============================================================================
// FAKES
// ============================================================================

pub mod fakes {
    use super::*;
    use async_trait::async_trait;
    use keel_agents::{AgentCommand, CommandSink, NodeTransport, RunningAgents};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted reply for one peer.
    #[derive(Debug, Clone)]
    pub enum PeerScript {
        Running(Vec<AgentUri>),
        /// Reply claiming a different node id.
        RunningAs(NodeId, Vec<AgentUri>),
        Fail(String),
        /// Never reply within any sane timeout.
        Hang,
        /// Reply after a delay.
        Delayed(Duration, Vec<AgentUri>),
    }

    /// Peer transport answering from a script, recording every query.
    #[derive(Debug, Default)]
    pub struct ScriptedTransport {
        scripts: Mutex<HashMap<NodeId, PeerScript>>,
        queries: Mutex<Vec<NodeId>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_peer(self, node: NodeId, script: PeerScript) -> Self {
            self.set(node, script);
            self
        }

        pub fn set(&self, node: NodeId, script: PeerScript) {
            self.scripts.lock().unwrap().insert(node, script);
        }

        pub fn queries(&self) -> Vec<NodeId> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeTransport for ScriptedTransport {
        async fn query_agents(&self, node: NodeId) -> Result<RunningAgents, AgentError> {
            self.queries.lock().unwrap().push(node);
            let script = self.scripts.lock().unwrap().get(&node).cloned();
            match script {
                Some(PeerScript::Running(agents)) => Ok(RunningAgents {
                    node_id: node,
                    agents,
                }),
                Some(PeerScript::RunningAs(node_id, agents)) => Ok(RunningAgents { node_id, agents }),
                Some(PeerScript::Fail(reason)) => Err(AgentError::PeerUnavailable {
                    node_id: node,
                    reason,
                }),
                Some(PeerScript::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(AgentError::PeerUnavailable {
                        node_id: node,
                        reason: "hung".to_string(),
                    })
                }
                Some(PeerScript::Delayed(delay, agents)) => {
                    tokio::time::sleep(delay).await;
                    Ok(RunningAgents {
                        node_id: node,
                        agents,
                    })
                }
                None => Err(AgentError::PeerUnavailable {
                    node_id: node,
                    reason: "no script".to_string(),
                }),
            }
        }
    }

    /// Sink that records commands and can reject from the n-th call on.
    #[derive(Debug, Default)]
    pub struct RecordingCommandSink {
        executed: Mutex<Vec<AgentCommand>>,
        reject_from: Option<usize>,
        calls: Mutex<usize>,
    }

    impl RecordingCommandSink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Reject every call after the first `accepted` ones.
        pub fn rejecting_after(accepted: usize) -> Self {
            Self {
                reject_from: Some(accepted),
                ..Self::default()
            }
        }

        pub fn executed(&self) -> Vec<AgentCommand> {
            self.executed.lock().unwrap().clone()
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CommandSink for RecordingCommandSink {
        async fn execute(&self, command: &AgentCommand) -> Result<(), AgentError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if self.reject_from.is_some_and(|accepted| call > accepted) {
                return Err(AgentError::CommandRejected {
                    reason: format!("call {} rejected", call),
                });
            }
            self.executed.lock().unwrap().push(command.clone());
            Ok(())
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;
    use std::collections::HashSet;
    use std::fmt::Debug;

    /// Assert that a result is a hard queue error.
    pub fn assert_hard_error<T: Debug>(result: &Result<T, QueueError>) {
        match result {
            Err(e) => assert!(e.is_hard(), "Expected hard error, got {:?}", e),
            Ok(value) => panic!("Expected hard error, got Ok({:?})", value),
        }
    }

    pub fn assert_no_matching_outgoing<T: Debug>(result: &Result<T, QueueError>) {
        assert!(
            matches!(result, Err(QueueError::NoMatchingOutgoing { .. })),
            "Expected NoMatchingOutgoing, got {:?}",
            result
        );
    }

    /// Assert that no envelope id appears twice.
    pub fn assert_distinct_ids(envelopes: &[Envelope]) {
        let mut seen = HashSet::new();
        for envelope in envelopes {
            assert!(seen.insert(envelope.id), "Duplicate envelope id {}", envelope.id);
        }
    }
}
