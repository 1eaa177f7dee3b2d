//! Outbox Mover
//!
//! A producer writes its outgoing row inside its own database transaction.
//! Once that transaction commits, the mover relocates the row into the
//! destination queue's ready or scheduled table with the queue's atomic move
//! operations. Retrying a relocation is safe: a destination that already
//! holds the id reports [`MoveOutcome::AlreadyMoved`].

use crate::{MoveOutcome, QueueRouter};
use keel_core::{Envelope, MessageId, QueueError, QueueUri, Timestamp};
use std::sync::Arc;
use tracing::{debug, warn};

/// An outgoing row committed by a unit of work, awaiting relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMove {
    pub id: MessageId,
    pub destination: QueueUri,
    pub scheduled_time: Option<Timestamp>,
}

impl PendingMove {
    pub fn for_envelope(envelope: &Envelope) -> Result<Self, QueueError> {
        let destination = envelope
            .destination
            .clone()
            .ok_or(QueueError::MissingDestination { id: envelope.id })?;
        Ok(Self {
            id: envelope.id,
            destination,
            scheduled_time: envelope.scheduled_time,
        })
    }
}

/// Summary of a batch relocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationReport {
    pub moved: usize,
    pub already_moved: usize,
    /// Rows left in the outgoing table after a transient failure
    pub deferred: Vec<(MessageId, QueueError)>,
}

impl RelocationReport {
    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// Relocates committed outgoing rows into their destination queues.
#[derive(Clone)]
pub struct OutboxMover {
    router: Arc<dyn QueueRouter>,
}

impl OutboxMover {
    pub fn new(router: Arc<dyn QueueRouter>) -> Self {
        Self { router }
    }

    /// Relocate one row. Delivery in the future goes to the scheduled table.
    pub async fn relocate(&self, pending: &PendingMove) -> Result<MoveOutcome, QueueError> {
        let queue = self.router.queue_for(&pending.destination).ok_or_else(|| {
            QueueError::UnknownDestination {
                uri: pending.destination.to_string(),
            }
        })?;

        match pending.scheduled_time {
            Some(time) if time > queue.now() => {
                queue.move_outgoing_to_scheduled(pending.id, time).await
            }
            _ => queue.move_outgoing_to_ready(pending.id).await,
        }
    }

    /// Relocate a batch in order.
    ///
    /// Transient failures leave the row in the outgoing table and are
    /// reported; any other failure stops the batch and is returned.
    pub async fn relocate_all(
        &self,
        pending: &[PendingMove],
    ) -> Result<RelocationReport, QueueError> {
        let mut report = RelocationReport::default();

        for next in pending {
            match self.relocate(next).await {
                Ok(MoveOutcome::Moved) => report.moved += 1,
                Ok(MoveOutcome::AlreadyMoved) => {
                    debug!(id = %next.id, destination = %next.destination, "Envelope was already relocated");
                    report.already_moved += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        id = %next.id,
                        destination = %next.destination,
                        error = %e,
                        "Relocation deferred, envelope stays in outgoing"
                    );
                    report.deferred.push((next.id, e));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }
}
