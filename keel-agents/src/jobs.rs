//! Periodic verification driver.
//!
//! Each tick runs one cycle and hands the emitted commands, one at a time, to
//! the agent-lifecycle collaborator behind [`CommandSink`]. Commands the sink
//! accepts are applied to the tracker; the first rejection ends consumption
//! for that cycle and the remainder is recomputed on the next tick.

use crate::command::AgentCommand;
use crate::verifier::AssignmentVerifier;
use async_trait::async_trait;
use keel_core::{AgentError, VerifierConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Executes reconciliation commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn execute(&self, command: &AgentCommand) -> Result<(), AgentError>;
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct VerificationMetrics {
    /// Cycles that ran to completion
    pub cycles: AtomicU64,

    /// Ticks skipped because no assignment map exists yet
    pub skipped: AtomicU64,

    pub commands_emitted: AtomicU64,

    pub commands_applied: AtomicU64,

    /// Peers excluded from a cycle
    pub peer_failures: AtomicU64,

    pub sink_errors: AtomicU64,
}

impl VerificationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> VerificationSnapshot {
        VerificationSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            commands_emitted: self.commands_emitted.load(Ordering::Relaxed),
            commands_applied: self.commands_applied.load(Ordering::Relaxed),
            peer_failures: self.peer_failures.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationSnapshot {
    pub cycles: u64,
    pub skipped: u64,
    pub commands_emitted: u64,
    pub commands_applied: u64,
    pub peer_failures: u64,
    pub sink_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Verify every `config.check_interval` until shutdown.
pub async fn verification_task(
    verifier: Arc<AssignmentVerifier>,
    config: VerifierConfig,
    sink: Arc<dyn CommandSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<VerificationMetrics> {
    let metrics = Arc::new(VerificationMetrics::new());

    let mut check_interval = interval(config.check_interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = config.check_interval.as_millis() as u64,
        peer_timeout_ms = config.peer_timeout.as_millis() as u64,
        "Verification task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Verification task shutting down");
                    break;
                }
            }

            _ = check_interval.tick() => {
                run_cycle(&verifier, sink.as_ref(), &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        commands_emitted = snapshot.commands_emitted,
        commands_applied = snapshot.commands_applied,
        peer_failures = snapshot.peer_failures,
        sink_errors = snapshot.sink_errors,
        "Verification task completed"
    );

    metrics
}

/// One verification cycle followed by command execution.
pub async fn run_cycle(
    verifier: &AssignmentVerifier,
    sink: &dyn CommandSink,
    metrics: &VerificationMetrics,
) {
    let Some(outcome) = verifier.verify().await else {
        metrics.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    metrics.cycles.fetch_add(1, Ordering::Relaxed);
    metrics
        .peer_failures
        .fetch_add(outcome.failures.len() as u64, Ordering::Relaxed);
    metrics
        .commands_emitted
        .fetch_add(outcome.commands.len() as u64, Ordering::Relaxed);

    for command in outcome.into_commands() {
        if let Err(e) = sink.execute(&command).await {
            metrics.sink_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(command = %command, error = %e, "Command rejected, deferring rest of cycle");
            break;
        }

        verifier
            .tracker()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .apply(&command);
        metrics.commands_applied.fetch_add(1, Ordering::Relaxed);
    }
}
