//! Verification cycles against scripted and in-process peers.

use async_trait::async_trait;
use keel_agents::{
    run_cycle, verification_task, AgentCommand, AssignmentState, AssignmentVerifier, ChannelMesh,
    LocalAgentSet, NodeTracker, NodeTransport, RunningAgents, VerificationMetrics,
};
use keel_core::{AgentError, AgentUri, HealthStatus, ManualClock, NodeId, VerifierConfig};
use keel_test_utils::fakes::{PeerScript, RecordingCommandSink, ScriptedTransport};
use keel_test_utils::fixtures::{agent_uri, base_time, manual_clock, node};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

struct Cluster {
    tracker: Arc<RwLock<NodeTracker>>,
    local: Arc<LocalAgentSet>,
    clock: ManualClock,
}

impl Cluster {
    fn new(peers: &[u128]) -> Self {
        let mut tracker = NodeTracker::new(node(1), base_time());
        for peer in peers {
            tracker.node_seen(node(*peer), base_time());
        }
        Self {
            tracker: Arc::new(RwLock::new(tracker)),
            local: Arc::new(LocalAgentSet::new(node(1))),
            clock: manual_clock(),
        }
    }

    fn establish(&self, assignments: &[(&str, u128)]) {
        let map = assignments
            .iter()
            .map(|(uri, owner)| (agent_uri(uri), node(*owner)))
            .collect::<BTreeMap<_, _>>();
        self.tracker.write().unwrap().establish(map);
    }

    fn verifier(&self, transport: Arc<dyn keel_agents::NodeTransport>) -> AssignmentVerifier {
        AssignmentVerifier::new(
            self.tracker.clone(),
            transport,
            self.local.clone(),
            Arc::new(self.clock.clone()),
            &VerifierConfig::development(),
        )
    }
}

/// Reports `agents` from `departing` and drops that node from the cluster
/// while answering. Every other peer runs nothing.
struct DepartingTransport {
    tracker: Arc<RwLock<NodeTracker>>,
    departing: NodeId,
    agents: Vec<AgentUri>,
}

#[async_trait]
impl NodeTransport for DepartingTransport {
    async fn query_agents(&self, node: NodeId) -> Result<RunningAgents, AgentError> {
        if node != self.departing {
            return Ok(RunningAgents {
                node_id: node,
                agents: Vec::new(),
            });
        }
        self.tracker.write().unwrap().node_lost(node);
        Ok(RunningAgents {
            node_id: node,
            agents: self.agents.clone(),
        })
    }
}

#[tokio::test]
async fn test_every_live_peer_queried() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Running(vec![]))
            .with_peer(node(3), PeerScript::Running(vec![])),
    );
    let verifier = cluster.verifier(transport.clone());

    let outcome = verifier.verify().await.unwrap();
    assert!(outcome.is_converged());

    let mut queried = transport.queries();
    queried.sort();
    assert_eq!(queried, vec![node(2), node(3)]);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_peer_excluded() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[("a://two", 2), ("a://three", 3)]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Hang)
            .with_peer(node(3), PeerScript::Running(vec![agent_uri("a://three")])),
    );
    let verifier = cluster.verifier(transport);

    let outcome = verifier.verify().await.unwrap();
    assert_eq!(outcome.failures.len(), 1);
    assert!(matches!(
        outcome.failures[0].error,
        AgentError::PeerTimeout { .. }
    ));
    assert!(outcome.commands.is_empty());
    assert!(outcome.observed.has_responded(node(3)));
    assert!(!outcome.observed.has_responded(node(2)));
}

#[tokio::test]
async fn test_mismatched_reply_rejected() {
    let cluster = Cluster::new(&[2]);
    cluster.establish(&[]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::RunningAs(node(9), vec![agent_uri("a://x")])),
    );
    let outcome = cluster.verifier(transport).verify().await.unwrap();

    assert!(matches!(
        outcome.failures[0].error,
        AgentError::MismatchedReply { .. }
    ));
    assert!(outcome.observed.reporters(&agent_uri("a://x")).is_none());
}

#[tokio::test]
async fn test_conflict_stops_higher_node_and_marks_conflicted() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[("a://shared", 3)]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Running(vec![agent_uri("a://shared")]))
            .with_peer(node(3), PeerScript::Running(vec![agent_uri("a://shared")])),
    );
    let verifier = cluster.verifier(transport);

    let outcome = verifier.verify().await.unwrap();
    assert_eq!(
        outcome.commands,
        vec![
            AgentCommand::Stop {
                uri: agent_uri("a://shared"),
                node: node(3)
            },
            AgentCommand::Assign {
                uri: agent_uri("a://shared"),
                node: node(2)
            },
        ]
    );
    assert_eq!(
        cluster.tracker.read().unwrap().state_of(&agent_uri("a://shared")),
        AssignmentState::Conflicted
    );
}

#[tokio::test]
async fn test_cycle_applies_accepted_commands_and_converges() {
    let cluster = Cluster::new(&[2]);
    cluster.establish(&[("a://moved", 2)]);
    cluster.local.start(agent_uri("a://moved"));
    let transport = Arc::new(ScriptedTransport::new().with_peer(node(2), PeerScript::Running(vec![])));
    let verifier = cluster.verifier(transport);
    let sink = RecordingCommandSink::new();
    let metrics = VerificationMetrics::new();

    run_cycle(&verifier, &sink, &metrics).await;
    assert_eq!(
        sink.executed(),
        vec![AgentCommand::Assign {
            uri: agent_uri("a://moved"),
            node: node(1)
        }]
    );
    assert_eq!(
        cluster.tracker.read().unwrap().state_of(&agent_uri("a://moved")),
        AssignmentState::AssignedLocal
    );

    run_cycle(&verifier, &sink, &metrics).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cycles, 2);
    assert_eq!(snapshot.commands_emitted, 1);
    assert_eq!(snapshot.commands_applied, 1);
}

#[tokio::test]
async fn test_rejection_stops_consumption() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Running(vec![agent_uri("a://one")]))
            .with_peer(node(3), PeerScript::Running(vec![agent_uri("a://two")])),
    );
    let verifier = cluster.verifier(transport);
    let sink = RecordingCommandSink::rejecting_after(1);
    let metrics = VerificationMetrics::new();

    run_cycle(&verifier, &sink, &metrics).await;
    assert_eq!(sink.calls(), 2);
    assert_eq!(sink.executed().len(), 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.commands_emitted, 2);
    assert_eq!(snapshot.commands_applied, 1);
    assert_eq!(snapshot.sink_errors, 1);
    // The rejected Assign is not applied, but the observed owner still is.
    assert_eq!(
        cluster.tracker.read().unwrap().owner_of(&agent_uri("a://two")),
        Some(node(3))
    );
}

#[tokio::test]
async fn test_cycle_records_observed_owner() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[("a://one", 2)]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Running(vec![]))
            .with_peer(node(3), PeerScript::Running(vec![agent_uri("a://one")])),
    );
    let verifier = cluster.verifier(transport);

    let outcome = verifier.verify().await.unwrap();
    assert_eq!(
        outcome.commands,
        vec![AgentCommand::Assign {
            uri: agent_uri("a://one"),
            node: node(3)
        }]
    );
    assert_eq!(
        cluster.tracker.read().unwrap().owner_of(&agent_uri("a://one")),
        Some(node(3))
    );

    assert!(verifier.verify().await.unwrap().is_converged());
}

#[tokio::test]
async fn test_conflict_resolves_when_expected_owner_wins() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[("a://one", 2)]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Running(vec![agent_uri("a://one")]))
            .with_peer(node(3), PeerScript::Running(vec![agent_uri("a://one")])),
    );
    let verifier = cluster.verifier(transport.clone());
    let sink = RecordingCommandSink::new();
    let metrics = VerificationMetrics::new();

    run_cycle(&verifier, &sink, &metrics).await;
    assert_eq!(
        sink.executed(),
        vec![AgentCommand::Stop {
            uri: agent_uri("a://one"),
            node: node(3)
        }]
    );

    transport.set(node(3), PeerScript::Running(vec![]));
    run_cycle(&verifier, &sink, &metrics).await;

    assert_eq!(sink.executed().len(), 1);
    assert_eq!(
        cluster.tracker.read().unwrap().state_of(&agent_uri("a://one")),
        AssignmentState::AssignedRemote(node(2))
    );
}

#[tokio::test]
async fn test_conflict_clears_without_sink_once_loser_stops() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[("a://one", 2)]);
    let transport = Arc::new(
        ScriptedTransport::new()
            .with_peer(node(2), PeerScript::Running(vec![agent_uri("a://one")]))
            .with_peer(node(3), PeerScript::Running(vec![agent_uri("a://one")])),
    );
    let verifier = cluster.verifier(transport.clone());

    verifier.verify().await.unwrap();
    assert_eq!(
        cluster.tracker.read().unwrap().state_of(&agent_uri("a://one")),
        AssignmentState::Conflicted
    );

    transport.set(node(3), PeerScript::Running(vec![]));
    assert!(verifier.verify().await.unwrap().is_converged());
    assert_eq!(
        cluster.tracker.read().unwrap().state_of(&agent_uri("a://one")),
        AssignmentState::AssignedRemote(node(2))
    );
}

#[tokio::test]
async fn test_node_lost_during_cycle_stays_departed() {
    let cluster = Cluster::new(&[2, 3]);
    cluster.establish(&[("a://one", 2)]);
    let transport = Arc::new(DepartingTransport {
        tracker: cluster.tracker.clone(),
        departing: node(2),
        agents: vec![agent_uri("a://one")],
    });
    let verifier = cluster.verifier(transport);
    let sink = RecordingCommandSink::new();
    let metrics = VerificationMetrics::new();

    run_cycle(&verifier, &sink, &metrics).await;
    assert!(!cluster.tracker.read().unwrap().is_live(node(2)));

    let executed = sink.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(
        executed[0],
        AgentCommand::Stop {
            uri: agent_uri("a://one"),
            node: node(2)
        }
    );
    match &executed[1] {
        AgentCommand::Assign { uri, node: target } => {
            assert_eq!(uri, &agent_uri("a://one"));
            assert!(*target == node(1) || *target == node(3));
        }
        other => panic!("unexpected command {other}"),
    }

    let owner = cluster.tracker.read().unwrap().owner_of(&agent_uri("a://one"));
    assert!(owner == Some(node(1)) || owner == Some(node(3)));
}

#[tokio::test]
async fn test_mesh_cluster_converges_after_node_loss() {
    let mesh = ChannelMesh::new();
    let cluster = Cluster::new(&[2, 3]);
    let peer_two = Arc::new(LocalAgentSet::new(node(2)));
    let peer_three = Arc::new(LocalAgentSet::new(node(3)));
    peer_two.start(agent_uri("a://two"));
    peer_three.start(agent_uri("a://three"));
    mesh.register(peer_two.clone());
    mesh.register(peer_three.clone());
    cluster.establish(&[("a://two", 2), ("a://three", 3)]);

    let verifier = cluster.verifier(Arc::new(mesh.clone()));
    assert!(verifier.verify().await.unwrap().is_converged());

    mesh.unregister(node(3));
    cluster.tracker.write().unwrap().node_lost(node(3));

    let sink = RecordingCommandSink::new();
    let metrics = VerificationMetrics::new();
    run_cycle(&verifier, &sink, &metrics).await;

    let executed = sink.executed();
    assert_eq!(executed.len(), 1);
    match &executed[0] {
        AgentCommand::Assign { uri, node: target } => {
            assert_eq!(uri, &agent_uri("a://three"));
            assert!(*target == node(1) || *target == node(2));
        }
        other => panic!("unexpected command {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_task_runs_until_shutdown() {
    let cluster = Cluster::new(&[]);
    cluster.establish(&[]);
    let verifier = Arc::new(cluster.verifier(Arc::new(ScriptedTransport::new())));
    let sink = Arc::new(RecordingCommandSink::new());
    let config = VerifierConfig::development();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(verification_task(
        verifier.clone(),
        config.clone(),
        sink,
        shutdown_rx,
    ));

    tokio::time::sleep(config.check_interval * 3 + Duration::from_millis(10)).await;
    shutdown_tx.send(true).unwrap();
    let metrics = handle.await.unwrap();

    assert!(metrics.snapshot().cycles >= 3);
    assert_eq!(verifier.health(&config).status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_health_unknown_before_first_cycle() {
    let cluster = Cluster::new(&[]);
    let verifier = cluster.verifier(Arc::new(ScriptedTransport::new()));
    assert_eq!(
        verifier.health(&VerifierConfig::development()).status,
        HealthStatus::Unknown
    );
    assert!(verifier.verify().await.is_none());
}
