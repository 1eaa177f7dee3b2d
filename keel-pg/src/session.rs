//! PostgreSQL unit of work.
//!
//! A session holds one pooled connection with an open transaction. Outgoing
//! envelopes are inserted inside that transaction, next to whatever business
//! statements the caller runs through [`PgSession::client`].

use crate::db::connection;
use crate::error::DbResultExt;
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use keel_core::{Envelope, EnvelopeSerializer, NodeId, QueueError};
use keel_storage::{PendingMove, SessionFactory, UnitOfWork};
use std::sync::Arc;
use tokio_postgres::Client;
use tracing::{debug, warn};

/// Opens [`PgSession`]s for one node.
#[derive(Clone)]
pub struct PgSessionFactory {
    pool: Pool,
    serializer: Arc<dyn EnvelopeSerializer>,
    insert_outgoing: Arc<str>,
    node: NodeId,
}

impl PgSessionFactory {
    pub fn new(
        pool: Pool,
        serializer: Arc<dyn EnvelopeSerializer>,
        outgoing_table: &str,
        node: NodeId,
    ) -> Self {
        let insert_outgoing = format!(
            "INSERT INTO {} (id, owner_id, destination, deliver_by, body, message_type, attempts) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            outgoing_table
        );
        Self {
            pool,
            serializer,
            insert_outgoing: insert_outgoing.into(),
            node,
        }
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    type Session = PgSession;

    async fn open(&self) -> Result<PgSession, QueueError> {
        let client = connection(&self.pool).await?;
        client.batch_execute("BEGIN").await.db("begin")?;
        Ok(PgSession {
            client: Some(client),
            serializer: self.serializer.clone(),
            insert_outgoing: self.insert_outgoing.clone(),
            node: self.node,
            pending: Vec::new(),
        })
    }
}

/// One open transaction.
///
/// Dropping an unfinished session detaches its connection from the pool and
/// closes it, so the server aborts the transaction.
pub struct PgSession {
    client: Option<Object>,
    serializer: Arc<dyn EnvelopeSerializer>,
    insert_outgoing: Arc<str>,
    node: NodeId,
    pending: Vec<PendingMove>,
}

impl PgSession {
    /// The connection running this session's transaction.
    pub fn client(&self) -> Result<&Client, QueueError> {
        self.client
            .as_deref()
            .map(|wrapper| &**wrapper)
            .ok_or(QueueError::SessionFinished)
    }

    fn take_client(&mut self) -> Result<Object, QueueError> {
        self.client.take().ok_or(QueueError::SessionFinished)
    }
}

#[async_trait]
impl UnitOfWork for PgSession {
    async fn publish(&mut self, envelope: Envelope) -> Result<(), QueueError> {
        let pending = PendingMove::for_envelope(&envelope)?;
        let body = self.serializer.serialize(&envelope)?;
        let owner = self.node.as_uuid();
        let destination = pending.destination.to_string();

        self.client()?
            .execute(
                &*self.insert_outgoing,
                &[
                    &envelope.id,
                    &owner,
                    &destination,
                    &envelope.keep_until,
                    &body,
                    &envelope.message_type,
                    &envelope.attempts,
                ],
            )
            .await
            .db("publish")?;

        self.pending.push(pending);
        Ok(())
    }

    async fn commit(mut self) -> Result<Vec<PendingMove>, QueueError> {
        let client = self.take_client()?;
        client.batch_execute("COMMIT").await.db("commit")?;
        debug!(count = self.pending.len(), "Session committed");
        Ok(std::mem::take(&mut self.pending))
    }

    async fn rollback(mut self) -> Result<(), QueueError> {
        let client = self.take_client()?;
        client.batch_execute("ROLLBACK").await.db("rollback")?;
        debug!(discarded = self.pending.len(), "Session rolled back");
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!(
                staged = self.pending.len(),
                "Session dropped with an open transaction, closing its connection"
            );
            drop(Object::take(client));
        }
    }
}
