//! KEEL Storage - Durable Queue Traits and In-Memory Implementation
//!
//! Defines the queue store abstraction used by the outbox mover, the
//! background durability task and listeners. The Postgres implementation
//! lives in keel-pg; the in-memory implementation here backs tests and
//! single-process deployments.

pub mod memory;
pub mod outbox;
pub mod unit_of_work;

pub use memory::{
    InMemoryEnvelopeStore, InMemoryQueue, InMemorySession, InMemorySessionFactory,
    InMemoryTransport, InboxRow, InboxStatus, OutgoingRow, MEMORY_PROTOCOL,
};
pub use outbox::{OutboxMover, PendingMove, RelocationReport};
pub use unit_of_work::{in_unit_of_work, SessionFactory, UnitOfWork};

use async_trait::async_trait;
use keel_core::{
    EndpointMode, Envelope, MessageId, NodeId, QueueError, QueueUri, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// OUTCOMES
// ============================================================================

/// Result of inserting into the ready table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// The id was already present; the first write wins
    AlreadyEnqueued,
}

/// Result of relocating an outgoing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// The destination already held the id; the stale outgoing row was removed
    AlreadyMoved,
}

/// Administrative snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    pub name: String,
    pub count: i64,
    pub scheduled: i64,
}

// ============================================================================
// DURABLE QUEUE
// ============================================================================

/// One named queue: a ready table and a scheduled table.
///
/// Every operation is a single atomic unit. Duplicate ids are reported
/// through [`EnqueueOutcome`] and [`MoveOutcome`], never as errors.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    fn uri(&self) -> &QueueUri;

    fn name(&self) -> &str {
        self.uri().name()
    }

    fn mode(&self) -> EndpointMode;

    /// Listener batch size.
    fn maximum_messages_to_receive(&self) -> i64;

    /// Current time as seen by this queue's store.
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }

    /// Insert into the ready table, ignoring a duplicate id.
    async fn enqueue_ready(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError>;

    /// Upsert into the scheduled table by id.
    async fn enqueue_scheduled(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Relocate an outgoing row into the ready table.
    async fn move_outgoing_to_ready(&self, id: MessageId) -> Result<MoveOutcome, QueueError>;

    /// Relocate an outgoing row into the scheduled table.
    async fn move_outgoing_to_scheduled(
        &self,
        id: MessageId,
        time: Timestamp,
    ) -> Result<MoveOutcome, QueueError>;

    /// Promote due scheduled rows. Returns the number moved.
    async fn sweep_scheduled_to_ready(&self) -> Result<u64, QueueError>;

    /// Delete ready and scheduled rows past their keep-until.
    async fn delete_expired(&self) -> Result<u64, QueueError>;

    /// Remove up to `max` oldest ready rows.
    async fn pop_direct(&self, max: i64) -> Result<Vec<Envelope>, QueueError>;

    /// Hand up to `max` oldest ready rows to `node`'s inbox.
    async fn pop_to_inbox(&self, max: i64, node: NodeId) -> Result<Vec<Envelope>, QueueError>;

    /// Move an inbox row back to the scheduled table for a later attempt.
    async fn schedule_retry(&self, envelope: &Envelope) -> Result<(), QueueError>;

    async fn count(&self) -> Result<i64, QueueError>;

    async fn scheduled_count(&self) -> Result<i64, QueueError>;

    /// Enqueue, routing to the scheduled table when delivery is in the future.
    async fn send(&self, envelope: &Envelope) -> Result<(), QueueError> {
        if envelope.is_scheduled_for_later(self.now()) {
            self.enqueue_scheduled(envelope).await
        } else {
            self.enqueue_ready(envelope).await.map(|_| ())
        }
    }

    /// Pull one listener batch according to the queue's endpoint mode.
    async fn pop_batch(&self, node: NodeId) -> Result<Vec<Envelope>, QueueError> {
        let max = self.maximum_messages_to_receive();
        match self.mode() {
            EndpointMode::Durable => self.pop_to_inbox(max, node).await,
            EndpointMode::BufferedInMemory => self.pop_direct(max).await,
            other => Err(QueueError::UnsupportedMode {
                queue: self.name().to_string(),
                mode: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// ADMINISTRATION
// ============================================================================

/// Provisioning surface for an external operator.
#[async_trait]
pub trait QueueAdmin: DurableQueue {
    /// One-time startup: provision and/or purge per configuration.
    async fn initialize(&self) -> Result<(), QueueError>;

    /// Delete every ready and scheduled row.
    async fn purge(&self) -> Result<(), QueueError>;

    /// Create the queue's tables if missing.
    async fn setup(&self) -> Result<(), QueueError>;

    /// Drop the queue's tables.
    async fn teardown(&self) -> Result<(), QueueError>;

    /// True when the tables exist with the expected shape.
    async fn check(&self) -> Result<bool, QueueError>;

    async fn attributes(&self) -> Result<QueueAttributes, QueueError> {
        Ok(QueueAttributes {
            name: self.name().to_string(),
            count: self.count().await?,
            scheduled: self.scheduled_count().await?,
        })
    }
}

// ============================================================================
// ROUTING
// ============================================================================

/// Resolves a destination uri to its queue.
pub trait QueueRouter: Send + Sync {
    fn queue_for(&self, destination: &QueueUri) -> Option<Arc<dyn DurableQueue>>;
}
