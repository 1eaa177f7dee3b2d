//! Durability Background Task
//!
//! Two independent timers drive the store's housekeeping:
//!
//! - every `scheduled_poll_interval`, due scheduled envelopes are promoted
//!   into each queue's ready table
//! - every `expired_cleanup_interval`, rows past their keep-until are deleted
//!
//! Any node may run this task; row locking lets several sweepers run at once
//! without blocking each other. Failures are logged and counted, and the next
//! tick simply tries again.

use keel_core::DurabilityConfig;
use keel_storage::DurableQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the durability task.
#[derive(Debug, Default)]
pub struct DurabilityMetrics {
    /// Scheduled sweep cycles completed
    pub sweep_cycles: AtomicU64,

    /// Envelopes promoted from scheduled to ready
    pub envelopes_promoted: AtomicU64,

    /// Expiry cycles completed
    pub expiry_cycles: AtomicU64,

    /// Expired rows deleted
    pub envelopes_expired: AtomicU64,

    /// Failed queue operations
    pub errors: AtomicU64,
}

impl DurabilityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DurabilitySnapshot {
        DurabilitySnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            envelopes_promoted: self.envelopes_promoted.load(Ordering::Relaxed),
            expiry_cycles: self.expiry_cycles.load(Ordering::Relaxed),
            envelopes_expired: self.envelopes_expired.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of durability metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurabilitySnapshot {
    pub sweep_cycles: u64,
    pub envelopes_promoted: u64,
    pub expiry_cycles: u64,
    pub envelopes_expired: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run housekeeping over `queues` until the shutdown signal is received.
///
/// Returns the metrics collected during the task's lifetime.
pub async fn durability_task(
    queues: Vec<Arc<dyn DurableQueue>>,
    config: DurabilityConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> Arc<DurabilityMetrics> {
    let metrics = Arc::new(DurabilityMetrics::new());
    run_durability(queues, config, shutdown_rx, metrics.clone()).await;
    metrics
}

/// Like [`durability_task`], reporting into caller-owned metrics.
pub async fn run_durability(
    queues: Vec<Arc<dyn DurableQueue>>,
    config: DurabilityConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<DurabilityMetrics>,
) {
    let mut sweep_interval = interval(config.scheduled_poll_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut expiry_interval = interval(config.expired_cleanup_interval);
    expiry_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        queues = queues.len(),
        scheduled_poll_ms = config.scheduled_poll_interval.as_millis() as u64,
        expired_cleanup_ms = config.expired_cleanup_interval.as_millis() as u64,
        "Durability task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Durability task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweep_scheduled(&queues, &metrics).await;
            }

            _ = expiry_interval.tick() => {
                delete_expired(&queues, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweep_cycles = snapshot.sweep_cycles,
        envelopes_promoted = snapshot.envelopes_promoted,
        expiry_cycles = snapshot.expiry_cycles,
        envelopes_expired = snapshot.envelopes_expired,
        errors = snapshot.errors,
        "Durability task completed"
    );
}

/// One sweep over every queue.
pub async fn sweep_scheduled(queues: &[Arc<dyn DurableQueue>], metrics: &DurabilityMetrics) {
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    for queue in queues {
        match queue.sweep_scheduled_to_ready().await {
            Ok(0) => {}
            Ok(moved) => {
                metrics.envelopes_promoted.fetch_add(moved, Ordering::Relaxed);
                tracing::debug!(queue = %queue.uri(), moved, "Scheduled envelopes promoted");
            }
            Err(e) => {
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(queue = %queue.uri(), error = %e, "Scheduled sweep failed");
            }
        }
    }
}

/// One expiry pass over every queue.
pub async fn delete_expired(queues: &[Arc<dyn DurableQueue>], metrics: &DurabilityMetrics) {
    metrics.expiry_cycles.fetch_add(1, Ordering::Relaxed);

    for queue in queues {
        match queue.delete_expired().await {
            Ok(0) => {}
            Ok(deleted) => {
                metrics.envelopes_expired.fetch_add(deleted, Ordering::Relaxed);
                tracing::debug!(queue = %queue.uri(), deleted, "Expired envelopes deleted");
            }
            Err(e) => {
                metrics.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(queue = %queue.uri(), error = %e, "Expired envelope cleanup failed");
            }
        }
    }
}
