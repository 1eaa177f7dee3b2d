//! Unit of work
//!
//! A session wraps one store transaction. Business code publishes envelopes
//! through it; they land in the outgoing table only when the session commits,
//! and are relocated into their queues afterwards.

use crate::{OutboxMover, PendingMove};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use keel_core::{Envelope, KeelResult, QueueError};
use tracing::{debug, warn};

/// A transactional session that stages outgoing envelopes.
///
/// Dropping a session without committing discards everything it staged.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Stage an envelope for the outgoing table.
    async fn publish(&mut self, envelope: Envelope) -> Result<(), QueueError>;

    /// Commit the transaction, returning the rows to relocate.
    async fn commit(self) -> Result<Vec<PendingMove>, QueueError>;

    async fn rollback(self) -> Result<(), QueueError>;
}

/// Source of sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: UnitOfWork;

    async fn open(&self) -> Result<Self::Session, QueueError>;
}

/// Run `work` inside a session.
///
/// On `Ok` the session commits and its outgoing rows are relocated; a
/// relocation failure that is not transient is returned to the caller. On
/// `Err` the session rolls back and the work's error is returned.
pub async fn in_unit_of_work<F, T, W>(factory: &F, mover: &OutboxMover, work: W) -> KeelResult<T>
where
    F: SessionFactory,
    W: for<'s> FnOnce(&'s mut F::Session) -> BoxFuture<'s, KeelResult<T>>,
{
    let mut session = factory.open().await?;

    let value = match work(&mut session).await {
        Ok(value) => value,
        Err(e) => {
            if let Err(rollback_err) = session.rollback().await {
                warn!(error = %rollback_err, "Rollback of failed unit of work also failed");
            }
            return Err(e);
        }
    };

    let pending = session.commit().await?;
    let report = mover.relocate_all(&pending).await?;
    debug!(
        moved = report.moved,
        already_moved = report.already_moved,
        deferred = report.deferred.len(),
        "Unit of work committed"
    );

    Ok(value)
}
