//! PostgreSQL durable queue.
//!
//! Each queue owns a ready table `<prefix>_<name>` and a scheduled table
//! `<prefix>_<name>_scheduled`. Competing consumers and sweepers select rows
//! with `FOR UPDATE SKIP LOCKED`, so concurrent pops never block each other
//! and never return the same row. Every operation is one transaction bounded
//! by the configured operation timeout.

use crate::db::connection;
use crate::error::{is_unique_violation, DbResultExt};
use crate::schema::{create_schema_sql, SchemaDrift, TableDefinition, INCOMING_TABLE, OUTGOING_TABLE};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use keel_core::{
    is_valid_identifier, EndpointMode, Envelope, EnvelopeSerializer, MessageId, NodeId,
    QueueError, QueueUri, Timestamp, TransportConfig, POSTGRES_PROTOCOL,
};
use keel_storage::{DurableQueue, EnqueueOutcome, MoveOutcome, QueueAdmin};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_postgres::Row;
use tracing::{debug, error, info, warn};

// ============================================================================
// STATEMENTS
// ============================================================================

/// SQL for one queue, rendered once at construction.
#[derive(Debug, Clone)]
pub(crate) struct QueueSql {
    pub enqueue_ready: String,
    pub enqueue_scheduled: String,
    pub move_to_ready: String,
    pub move_to_scheduled: String,
    pub delete_outgoing: String,
    pub sweep: String,
    pub delete_expired_ready: String,
    pub delete_expired_scheduled: String,
    pub pop_direct: String,
    pub remove_already_received: String,
    pub pop_to_inbox: String,
    pub delete_incoming: String,
    pub count: String,
    pub scheduled_count: String,
    pub purge_ready: String,
    pub purge_scheduled: String,
}

impl QueueSql {
    pub(crate) fn new(ready: &str, scheduled: &str, outgoing: &str, incoming: &str) -> Self {
        Self {
            enqueue_ready: format!(
                "INSERT INTO {ready} (id, body, message_type, keep_until) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (id) DO NOTHING"
            ),
            enqueue_scheduled: format!(
                "INSERT INTO {scheduled} (id, body, message_type, keep_until, execution_time) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO UPDATE SET body = excluded.body, \
                 message_type = excluded.message_type, keep_until = excluded.keep_until, \
                 execution_time = excluded.execution_time"
            ),
            move_to_ready: format!(
                "INSERT INTO {ready} (id, body, message_type, keep_until) \
                 SELECT id, body, message_type, deliver_by FROM {outgoing} WHERE id = $1"
            ),
            move_to_scheduled: format!(
                "INSERT INTO {scheduled} (id, body, message_type, keep_until, execution_time) \
                 SELECT id, body, message_type, deliver_by, $2::timestamptz \
                 FROM {outgoing} WHERE id = $1"
            ),
            delete_outgoing: format!("DELETE FROM {outgoing} WHERE id = $1"),
            sweep: format!(
                "WITH due AS (SELECT id FROM {scheduled} \
                 WHERE execution_time <= now() AND id NOT IN (SELECT id FROM {ready}) \
                 ORDER BY enqueued_at FOR UPDATE SKIP LOCKED), \
                 moved AS (DELETE FROM {scheduled} AS s USING due WHERE s.id = due.id \
                 RETURNING s.id, s.body, s.message_type, s.keep_until, s.enqueued_at) \
                 INSERT INTO {ready} (id, body, message_type, keep_until) \
                 SELECT id, body, message_type, keep_until FROM moved \
                 ORDER BY enqueued_at, id \
                 ON CONFLICT (id) DO NOTHING"
            ),
            delete_expired_ready: format!(
                "DELETE FROM {ready} WHERE keep_until IS NOT NULL AND keep_until <= now()"
            ),
            delete_expired_scheduled: format!(
                "DELETE FROM {scheduled} WHERE keep_until IS NOT NULL AND keep_until <= now()"
            ),
            pop_direct: format!(
                "WITH next AS (SELECT id FROM {ready} ORDER BY enqueued_at, id \
                 LIMIT $1 FOR UPDATE SKIP LOCKED) \
                 DELETE FROM {ready} AS r USING next WHERE r.id = next.id \
                 RETURNING r.id, r.body, r.message_type, r.enqueued_at"
            ),
            remove_already_received: format!(
                "WITH stale AS (SELECT r.id FROM {ready} AS r \
                 WHERE r.id IN (SELECT id FROM {incoming}) FOR UPDATE SKIP LOCKED) \
                 DELETE FROM {ready} AS r USING stale WHERE r.id = stale.id"
            ),
            pop_to_inbox: format!(
                "WITH next AS (SELECT id FROM {ready} ORDER BY enqueued_at, id \
                 LIMIT $1 FOR UPDATE SKIP LOCKED), \
                 popped AS (DELETE FROM {ready} AS r USING next WHERE r.id = next.id \
                 RETURNING r.id, r.body, r.message_type, r.keep_until, r.enqueued_at), \
                 received AS (INSERT INTO {incoming} \
                 (id, status, owner_node_id, body, message_type, destination, received_at, keep_until, attempts) \
                 SELECT id, 'Incoming', $2::uuid, body, message_type, $3::varchar, now(), keep_until, 0 \
                 FROM popped ON CONFLICT (id) DO NOTHING) \
                 SELECT id, body, message_type, enqueued_at FROM popped"
            ),
            delete_incoming: format!("DELETE FROM {incoming} WHERE id = $1"),
            count: format!("SELECT count(*) FROM {ready}"),
            scheduled_count: format!("SELECT count(*) FROM {scheduled}"),
            purge_ready: format!("DELETE FROM {ready}"),
            purge_scheduled: format!("DELETE FROM {scheduled}"),
        }
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// A named durable queue in PostgreSQL.
pub struct PostgresQueue {
    uri: QueueUri,
    pool: Pool,
    serializer: Arc<dyn EnvelopeSerializer>,
    schema_name: String,
    mode: EndpointMode,
    maximum_messages_to_receive: i64,
    operation_timeout: Duration,
    auto_provision: bool,
    auto_purge: bool,
    ready_table: TableDefinition,
    scheduled_table: TableDefinition,
    sql: QueueSql,
    initialized: OnceCell<()>,
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("uri", &self.uri)
            .field("ready_table", &self.ready_table.qualified_name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl PostgresQueue {
    /// Build a queue. Fails when the name is not a valid SQL identifier.
    pub fn new(
        name: &str,
        pool: Pool,
        serializer: Arc<dyn EnvelopeSerializer>,
        config: &TransportConfig,
    ) -> Result<Self, QueueError> {
        let uri = QueueUri::new(POSTGRES_PROTOCOL, name)?;
        let table_name = format!("{}_{}", config.table_prefix, name);
        let ready_table = TableDefinition::queue(&config.schema_name, &table_name);
        let scheduled_name = format!("{}_scheduled", table_name);
        if !is_valid_identifier(&scheduled_name) {
            return Err(QueueError::InvalidQueueName {
                name: name.to_string(),
            });
        }
        let scheduled_table = TableDefinition::scheduled(&config.schema_name, &scheduled_name);
        let sql = QueueSql::new(
            &ready_table.qualified_name(),
            &scheduled_table.qualified_name(),
            &format!("{}.{}", config.schema_name, OUTGOING_TABLE),
            &format!("{}.{}", config.schema_name, INCOMING_TABLE),
        );

        Ok(Self {
            uri,
            pool,
            serializer,
            schema_name: config.schema_name.clone(),
            mode: config.mode,
            maximum_messages_to_receive: config.maximum_messages_to_receive,
            operation_timeout: config.operation_timeout,
            auto_provision: config.auto_provision,
            auto_purge: config.auto_purge_all_queues,
            ready_table,
            scheduled_table,
            sql,
            initialized: OnceCell::new(),
        })
    }

    pub fn with_mode(mut self, mode: EndpointMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn ready_table(&self) -> &TableDefinition {
        &self.ready_table
    }

    pub fn scheduled_table(&self) -> &TableDefinition {
        &self.scheduled_table
    }

    /// Run `work` under the operation timeout. Dropping the work on timeout
    /// drops its transaction, which rolls back.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        match tokio::time::timeout(self.operation_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(queue = %self.uri, operation, "Queue operation timed out");
                Err(QueueError::Timeout {
                    operation: operation.to_string(),
                    after: self.operation_timeout,
                })
            }
        }
    }

    fn body(&self, envelope: &Envelope) -> Result<Vec<u8>, QueueError> {
        Ok(self.serializer.serialize(envelope)?)
    }

    /// Decode popped rows oldest first, substituting a placeholder for any
    /// unreadable body.
    fn decode_rows(&self, operation: &str, rows: Vec<Row>) -> Result<Vec<Envelope>, QueueError> {
        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let enqueued_at: Timestamp = row.try_get("enqueued_at").db(operation)?;
            decoded.push((enqueued_at, row.try_get::<_, MessageId>("id").db(operation)?));
        }
        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_by_key(|&i| decoded[i]);

        let mut envelopes = Vec::with_capacity(rows.len());
        for i in order {
            let row = &rows[i];
            let body: Vec<u8> = row.try_get("body").db(operation)?;
            match self.serializer.deserialize(&body) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    let message_type: String = row.try_get("message_type").db(operation)?;
                    error!(
                        queue = %self.uri,
                        id = %decoded[i].1,
                        %message_type,
                        error = %e,
                        "Discarding unreadable envelope"
                    );
                    envelopes.push(Envelope::for_ping(self.uri.clone()));
                }
            }
        }
        Ok(envelopes)
    }

    async fn count_rows(&self, operation: &'static str, sql: &str) -> Result<i64, QueueError> {
        self.bounded(operation, async {
            let client = connection(&self.pool).await?;
            let row = client.query_one(sql, &[]).await.db(operation)?;
            row.try_get::<_, i64>(0).db(operation)
        })
        .await
    }

    /// Shared handling for both move variants. The copy lands before the
    /// outgoing row is deleted, so an overlapping mover blocks on the
    /// destination key and then sees the duplicate.
    async fn move_outgoing(
        &self,
        operation: &'static str,
        id: MessageId,
        sql: &str,
        time: Option<Timestamp>,
    ) -> Result<MoveOutcome, QueueError> {
        self.bounded(operation, async {
            let mut client = connection(&self.pool).await?;
            let tx = client.transaction().await.db(operation)?;
            let copied = match time {
                Some(time) => tx.execute(sql, &[&id, &time]).await,
                None => tx.execute(sql, &[&id]).await,
            };

            match copied {
                Ok(0) => Err(QueueError::NoMatchingOutgoing {
                    queue: self.name().to_string(),
                    id,
                }),
                Ok(_) => {
                    tx.execute(self.sql.delete_outgoing.as_str(), &[&id])
                        .await
                        .db(operation)?;
                    tx.commit().await.db(operation)?;
                    Ok(MoveOutcome::Moved)
                }
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await.db(operation)?;
                    debug!(queue = %self.uri, %id, "Envelope already moved, removing stale outgoing row");
                    client
                        .execute(self.sql.delete_outgoing.as_str(), &[&id])
                        .await
                        .db(operation)?;
                    Ok(MoveOutcome::AlreadyMoved)
                }
                Err(e) => Err(crate::error::database_error(operation, e)),
            }
        })
        .await
    }
}

#[async_trait]
impl DurableQueue for PostgresQueue {
    fn uri(&self) -> &QueueUri {
        &self.uri
    }

    fn mode(&self) -> EndpointMode {
        self.mode
    }

    fn maximum_messages_to_receive(&self) -> i64 {
        self.maximum_messages_to_receive
    }

    async fn enqueue_ready(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError> {
        let body = self.body(envelope)?;
        self.bounded("enqueue_ready", async {
            let client = connection(&self.pool).await?;
            let inserted = client
                .execute(
                    self.sql.enqueue_ready.as_str(),
                    &[&envelope.id, &body, &envelope.message_type, &envelope.keep_until],
                )
                .await
                .db("enqueue_ready")?;

            if inserted == 0 {
                debug!(queue = %self.uri, id = %envelope.id, "Envelope already enqueued");
                Ok(EnqueueOutcome::AlreadyEnqueued)
            } else {
                Ok(EnqueueOutcome::Inserted)
            }
        })
        .await
    }

    async fn enqueue_scheduled(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let execution_time = envelope
            .scheduled_time
            .ok_or(QueueError::MissingScheduledTime { id: envelope.id })?;
        let body = self.body(envelope)?;

        self.bounded("enqueue_scheduled", async {
            let client = connection(&self.pool).await?;
            client
                .execute(
                    self.sql.enqueue_scheduled.as_str(),
                    &[
                        &envelope.id,
                        &body,
                        &envelope.message_type,
                        &envelope.keep_until,
                        &execution_time,
                    ],
                )
                .await
                .db("enqueue_scheduled")?;
            Ok(())
        })
        .await
    }

    async fn move_outgoing_to_ready(&self, id: MessageId) -> Result<MoveOutcome, QueueError> {
        self.move_outgoing("move_outgoing_to_ready", id, &self.sql.move_to_ready, None)
            .await
    }

    async fn move_outgoing_to_scheduled(
        &self,
        id: MessageId,
        time: Timestamp,
    ) -> Result<MoveOutcome, QueueError> {
        self.move_outgoing(
            "move_outgoing_to_scheduled",
            id,
            &self.sql.move_to_scheduled,
            Some(time),
        )
        .await
    }

    async fn sweep_scheduled_to_ready(&self) -> Result<u64, QueueError> {
        self.bounded("sweep_scheduled_to_ready", async {
            let client = connection(&self.pool).await?;
            let moved = client
                .execute(self.sql.sweep.as_str(), &[])
                .await
                .db("sweep_scheduled_to_ready")?;
            if moved > 0 {
                debug!(queue = %self.uri, moved, "Promoted scheduled envelopes");
            }
            Ok(moved)
        })
        .await
    }

    async fn delete_expired(&self) -> Result<u64, QueueError> {
        self.bounded("delete_expired", async {
            let mut client = connection(&self.pool).await?;
            let tx = client.transaction().await.db("delete_expired")?;
            let ready = tx
                .execute(self.sql.delete_expired_ready.as_str(), &[])
                .await
                .db("delete_expired")?;
            let scheduled = tx
                .execute(self.sql.delete_expired_scheduled.as_str(), &[])
                .await
                .db("delete_expired")?;
            tx.commit().await.db("delete_expired")?;
            Ok(ready + scheduled)
        })
        .await
    }

    async fn pop_direct(&self, max: i64) -> Result<Vec<Envelope>, QueueError> {
        if max <= 0 {
            return Ok(Vec::new());
        }

        self.bounded("pop_direct", async {
            let client = connection(&self.pool).await?;
            let rows = client
                .query(self.sql.pop_direct.as_str(), &[&max])
                .await
                .db("pop_direct")?;
            self.decode_rows("pop_direct", rows)
        })
        .await
    }

    async fn pop_to_inbox(&self, max: i64, node: NodeId) -> Result<Vec<Envelope>, QueueError> {
        if max <= 0 {
            return Ok(Vec::new());
        }
        let owner = node.as_uuid();
        let destination = self.uri.to_string();

        self.bounded("pop_to_inbox", async {
            let mut client = connection(&self.pool).await?;
            let tx = client.transaction().await.db("pop_to_inbox")?;

            let cleaned = tx
                .execute(self.sql.remove_already_received.as_str(), &[])
                .await
                .db("pop_to_inbox")?;
            if cleaned > 0 {
                debug!(queue = %self.uri, cleaned, "Removed ready rows already in the inbox");
            }

            let rows = tx
                .query(self.sql.pop_to_inbox.as_str(), &[&max, &owner, &destination])
                .await
                .db("pop_to_inbox")?;
            tx.commit().await.db("pop_to_inbox")?;

            self.decode_rows("pop_to_inbox", rows)
        })
        .await
    }

    async fn schedule_retry(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let execution_time = envelope
            .scheduled_time
            .ok_or(QueueError::MissingScheduledTime { id: envelope.id })?;
        let body = self.body(envelope)?;

        self.bounded("schedule_retry", async {
            let mut client = connection(&self.pool).await?;
            let tx = client.transaction().await.db("schedule_retry")?;
            tx.execute(self.sql.delete_incoming.as_str(), &[&envelope.id])
                .await
                .db("schedule_retry")?;
            tx.execute(
                self.sql.enqueue_scheduled.as_str(),
                &[
                    &envelope.id,
                    &body,
                    &envelope.message_type,
                    &envelope.keep_until,
                    &execution_time,
                ],
            )
            .await
            .db("schedule_retry")?;
            tx.commit().await.db("schedule_retry")
        })
        .await
    }

    async fn count(&self) -> Result<i64, QueueError> {
        self.count_rows("count", &self.sql.count).await
    }

    async fn scheduled_count(&self) -> Result<i64, QueueError> {
        self.count_rows("scheduled_count", &self.sql.scheduled_count)
            .await
    }
}

#[async_trait]
impl QueueAdmin for PostgresQueue {
    async fn initialize(&self) -> Result<(), QueueError> {
        self.initialized
            .get_or_try_init(|| async {
                if self.auto_provision {
                    self.setup().await?;
                }
                if self.auto_purge {
                    self.purge().await?;
                }
                info!(queue = %self.uri, "Queue initialized");
                Ok::<(), QueueError>(())
            })
            .await
            .map(|_| ())
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.bounded("purge", async {
            let mut client = connection(&self.pool).await?;
            let tx = client.transaction().await.db("purge")?;
            tx.execute(self.sql.purge_ready.as_str(), &[]).await.db("purge")?;
            tx.execute(self.sql.purge_scheduled.as_str(), &[]).await.db("purge")?;
            tx.commit().await.db("purge")?;
            info!(queue = %self.uri, "Queue purged");
            Ok(())
        })
        .await
    }

    async fn setup(&self) -> Result<(), QueueError> {
        let client = connection(&self.pool).await?;
        client
            .batch_execute(&create_schema_sql(&self.schema_name))
            .await
            .db("setup")?;
        self.ready_table.apply(&client).await?;
        self.scheduled_table.apply(&client).await?;
        info!(queue = %self.uri, table = %self.ready_table.qualified_name(), "Queue tables ready");
        Ok(())
    }

    async fn teardown(&self) -> Result<(), QueueError> {
        let client = connection(&self.pool).await?;
        client
            .batch_execute(&self.scheduled_table.drop_sql())
            .await
            .db("teardown")?;
        client
            .batch_execute(&self.ready_table.drop_sql())
            .await
            .db("teardown")?;
        info!(queue = %self.uri, "Queue tables dropped");
        Ok(())
    }

    async fn check(&self) -> Result<bool, QueueError> {
        let client = connection(&self.pool).await?;
        let ready = self.ready_table.check(&client).await?;
        let scheduled = self.scheduled_table.check(&client).await?;
        Ok(ready == SchemaDrift::None && scheduled == SchemaDrift::None)
    }
}
