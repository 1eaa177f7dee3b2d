//! In-memory queue store and transport.
//!
//! Every table of one store lives behind a single mutex, so each queue
//! operation is atomic with respect to every other and concurrent pops can
//! never hand out the same row twice.

use crate::{
    DurableQueue, EnqueueOutcome, MoveOutcome, PendingMove, QueueAdmin, QueueRouter,
    SessionFactory, UnitOfWork,
};
use async_trait::async_trait;
use keel_core::{
    Clock, EndpointMode, Envelope, EnvelopeSerializer, JsonEnvelopeSerializer, MessageId, NodeId,
    QueueError, QueueUri, SystemClock, Timestamp, TransportConfig,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Protocol segment of in-memory queue uris.
pub const MEMORY_PROTOCOL: &str = "memory";

// ============================================================================
// ROWS
// ============================================================================

#[derive(Debug, Clone)]
struct QueueRow {
    id: MessageId,
    body: Vec<u8>,
    message_type: String,
    keep_until: Option<Timestamp>,
    /// Insertion order
    seq: u64,
}

impl QueueRow {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.keep_until.is_some_and(|keep_until| keep_until <= now)
    }
}

#[derive(Debug, Clone)]
struct ScheduledRow {
    row: QueueRow,
    execution_time: Timestamp,
}

/// A row of the shared outgoing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRow {
    pub id: MessageId,
    pub owner: NodeId,
    pub destination: QueueUri,
    pub deliver_by: Option<Timestamp>,
    pub body: Vec<u8>,
    pub message_type: String,
    pub attempts: i32,
}

/// Processing state of an inbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Incoming,
    Handled,
}

/// A row of the shared inbox table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRow {
    pub id: MessageId,
    pub status: InboxStatus,
    pub owner: NodeId,
    pub body: Vec<u8>,
    pub message_type: String,
    pub destination: QueueUri,
    pub received_at: Timestamp,
    pub keep_until: Option<Timestamp>,
    pub attempts: i32,
}

#[derive(Debug, Default)]
struct QueueTables {
    /// Kept in `seq` order
    ready: Vec<QueueRow>,
    scheduled: HashMap<MessageId, ScheduledRow>,
}

impl QueueTables {
    fn has_ready(&self, id: MessageId) -> bool {
        self.ready.iter().any(|row| row.id == id)
    }

    fn upsert_scheduled(&mut self, row: QueueRow, execution_time: Timestamp) {
        match self.scheduled.entry(row.id) {
            Entry::Occupied(mut existing) => {
                let existing = existing.get_mut();
                existing.row.body = row.body;
                existing.row.message_type = row.message_type;
                existing.row.keep_until = row.keep_until;
                existing.execution_time = execution_time;
            }
            Entry::Vacant(slot) => {
                slot.insert(ScheduledRow {
                    row,
                    execution_time,
                });
            }
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    outgoing: HashMap<MessageId, OutgoingRow>,
    inbox: HashMap<MessageId, InboxRow>,
    queues: HashMap<String, QueueTables>,
    sequence: u64,
}

fn next_seq(sequence: &mut u64) -> u64 {
    *sequence += 1;
    *sequence
}

fn tables_mut<'a>(
    queues: &'a mut HashMap<String, QueueTables>,
    name: &str,
) -> Result<&'a mut QueueTables, QueueError> {
    queues.get_mut(name).ok_or_else(|| QueueError::Schema {
        table: name.to_string(),
        reason: "queue tables have not been set up".to_string(),
    })
}

// ============================================================================
// ENVELOPE STORE
// ============================================================================

/// Shared tables: outgoing, inbox and every queue's ready/scheduled tables.
pub struct InMemoryEnvelopeStore {
    state: Mutex<StoreState>,
    serializer: Arc<dyn EnvelopeSerializer>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryEnvelopeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEnvelopeStore")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEnvelopeStore {
    fn default() -> Self {
        Self::new(Arc::new(JsonEnvelopeSerializer), Arc::new(SystemClock))
    }
}

impl InMemoryEnvelopeStore {
    pub fn new(serializer: Arc<dyn EnvelopeSerializer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            serializer,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write outgoing rows in one step, as a committed producer transaction.
    pub fn store_outgoing(
        &self,
        envelopes: &[Envelope],
        owner: NodeId,
    ) -> Result<Vec<PendingMove>, QueueError> {
        let mut rows = Vec::with_capacity(envelopes.len());
        let mut pending = Vec::with_capacity(envelopes.len());

        for envelope in envelopes {
            let next = PendingMove::for_envelope(envelope)?;
            rows.push(OutgoingRow {
                id: envelope.id,
                owner,
                destination: next.destination.clone(),
                deliver_by: envelope.keep_until,
                body: self.serializer.serialize(envelope)?,
                message_type: envelope.message_type.clone(),
                attempts: envelope.attempts,
            });
            pending.push(next);
        }

        let mut state = self.lock();
        for row in rows {
            state.outgoing.insert(row.id, row);
        }
        Ok(pending)
    }

    /// Record a received envelope directly in `owner`'s inbox.
    pub fn store_incoming(&self, envelope: &Envelope, owner: NodeId) -> Result<(), QueueError> {
        let destination = envelope
            .destination
            .clone()
            .ok_or(QueueError::MissingDestination { id: envelope.id })?;
        let row = InboxRow {
            id: envelope.id,
            status: InboxStatus::Incoming,
            owner,
            body: self.serializer.serialize(envelope)?,
            message_type: envelope.message_type.clone(),
            destination,
            received_at: self.clock.now(),
            keep_until: envelope.keep_until,
            attempts: envelope.attempts,
        };
        self.lock().inbox.entry(row.id).or_insert(row);
        Ok(())
    }

    pub fn outgoing(&self, id: MessageId) -> Option<OutgoingRow> {
        self.lock().outgoing.get(&id).cloned()
    }

    pub fn outgoing_count(&self) -> usize {
        self.lock().outgoing.len()
    }

    pub fn inbox(&self, id: MessageId) -> Option<InboxRow> {
        self.lock().inbox.get(&id).cloned()
    }

    /// Inbox rows owned by `owner`, oldest first.
    pub fn inbox_for(&self, owner: NodeId) -> Vec<InboxRow> {
        let mut rows: Vec<InboxRow> = self
            .lock()
            .inbox
            .values()
            .filter(|row| row.owner == owner)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.received_at);
        rows
    }

    /// Mark an inbox row as processed. Returns false when it does not exist.
    pub fn mark_handled(&self, id: MessageId) -> bool {
        match self.lock().inbox.get_mut(&id) {
            Some(row) => {
                row.status = InboxStatus::Handled;
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// QUEUE
// ============================================================================

/// One named queue over an [`InMemoryEnvelopeStore`].
#[derive(Debug)]
pub struct InMemoryQueue {
    uri: QueueUri,
    store: Arc<InMemoryEnvelopeStore>,
    mode: EndpointMode,
    maximum_messages_to_receive: i64,
    auto_provision: bool,
    auto_purge: bool,
    initialized: OnceCell<()>,
}

impl InMemoryQueue {
    pub fn new(
        name: &str,
        store: Arc<InMemoryEnvelopeStore>,
        config: &TransportConfig,
    ) -> Result<Self, QueueError> {
        Ok(Self {
            uri: QueueUri::new(MEMORY_PROTOCOL, name)?,
            store,
            mode: config.mode,
            maximum_messages_to_receive: config.maximum_messages_to_receive,
            auto_provision: config.auto_provision,
            auto_purge: config.auto_purge_all_queues,
            initialized: OnceCell::new(),
        })
    }

    pub fn with_mode(mut self, mode: EndpointMode) -> Self {
        self.mode = mode;
        self
    }

    fn row_for(&self, envelope: &Envelope, seq: u64) -> Result<QueueRow, QueueError> {
        Ok(QueueRow {
            id: envelope.id,
            body: self.store.serializer.serialize(envelope)?,
            message_type: envelope.message_type.clone(),
            keep_until: envelope.keep_until,
            seq,
        })
    }

    /// Deserialize a popped body, substituting a placeholder when unreadable.
    fn decode(&self, row: QueueRow) -> Envelope {
        match self.store.serializer.deserialize(&row.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    queue = %self.uri,
                    id = %row.id,
                    message_type = %row.message_type,
                    error = %e,
                    "Discarding unreadable envelope"
                );
                Envelope::for_ping(self.uri.clone())
            }
        }
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    fn uri(&self) -> &QueueUri {
        &self.uri
    }

    fn mode(&self) -> EndpointMode {
        self.mode
    }

    fn maximum_messages_to_receive(&self) -> i64 {
        self.maximum_messages_to_receive
    }

    fn now(&self) -> Timestamp {
        self.store.clock.now()
    }

    async fn enqueue_ready(&self, envelope: &Envelope) -> Result<EnqueueOutcome, QueueError> {
        let mut guard = self.store.lock();
        let state = &mut *guard;
        let tables = tables_mut(&mut state.queues, self.name())?;

        if tables.has_ready(envelope.id) {
            debug!(queue = %self.uri, id = %envelope.id, "Envelope already enqueued");
            return Ok(EnqueueOutcome::AlreadyEnqueued);
        }

        let row = self.row_for(envelope, next_seq(&mut state.sequence))?;
        tables.ready.push(row);
        Ok(EnqueueOutcome::Inserted)
    }

    async fn enqueue_scheduled(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let execution_time = envelope
            .scheduled_time
            .ok_or(QueueError::MissingScheduledTime { id: envelope.id })?;

        let mut guard = self.store.lock();
        let state = &mut *guard;
        let tables = tables_mut(&mut state.queues, self.name())?;
        let row = self.row_for(envelope, next_seq(&mut state.sequence))?;
        tables.upsert_scheduled(row, execution_time);
        Ok(())
    }

    async fn move_outgoing_to_ready(&self, id: MessageId) -> Result<MoveOutcome, QueueError> {
        let mut guard = self.store.lock();
        let state = &mut *guard;
        let tables = tables_mut(&mut state.queues, self.name())?;

        let outgoing = state
            .outgoing
            .remove(&id)
            .ok_or_else(|| QueueError::NoMatchingOutgoing {
                queue: self.name().to_string(),
                id,
            })?;

        if tables.has_ready(id) {
            debug!(queue = %self.uri, %id, "Envelope already moved, stale outgoing row removed");
            return Ok(MoveOutcome::AlreadyMoved);
        }

        tables.ready.push(QueueRow {
            id,
            body: outgoing.body,
            message_type: outgoing.message_type,
            keep_until: outgoing.deliver_by,
            seq: next_seq(&mut state.sequence),
        });
        Ok(MoveOutcome::Moved)
    }

    async fn move_outgoing_to_scheduled(
        &self,
        id: MessageId,
        time: Timestamp,
    ) -> Result<MoveOutcome, QueueError> {
        let mut guard = self.store.lock();
        let state = &mut *guard;
        let tables = tables_mut(&mut state.queues, self.name())?;

        let outgoing = state
            .outgoing
            .remove(&id)
            .ok_or_else(|| QueueError::NoMatchingOutgoing {
                queue: self.name().to_string(),
                id,
            })?;

        if tables.scheduled.contains_key(&id) {
            debug!(queue = %self.uri, %id, "Envelope already scheduled, stale outgoing row removed");
            return Ok(MoveOutcome::AlreadyMoved);
        }

        let row = QueueRow {
            id,
            body: outgoing.body,
            message_type: outgoing.message_type,
            keep_until: outgoing.deliver_by,
            seq: next_seq(&mut state.sequence),
        };
        tables.scheduled.insert(
            id,
            ScheduledRow {
                row,
                execution_time: time,
            },
        );
        Ok(MoveOutcome::Moved)
    }

    async fn sweep_scheduled_to_ready(&self) -> Result<u64, QueueError> {
        let now = self.now();
        let mut guard = self.store.lock();
        let state = &mut *guard;
        let tables = tables_mut(&mut state.queues, self.name())?;

        let mut due: Vec<ScheduledRow> = tables
            .scheduled
            .values()
            .filter(|scheduled| scheduled.execution_time <= now && !tables.has_ready(scheduled.row.id))
            .cloned()
            .collect();
        due.sort_by_key(|scheduled| scheduled.row.seq);

        for scheduled in &due {
            tables.scheduled.remove(&scheduled.row.id);
        }
        let moved = due.len() as u64;
        for scheduled in due {
            let mut row = scheduled.row;
            row.seq = next_seq(&mut state.sequence);
            tables.ready.push(row);
        }

        Ok(moved)
    }

    async fn delete_expired(&self) -> Result<u64, QueueError> {
        let now = self.now();
        let mut guard = self.store.lock();
        let tables = tables_mut(&mut guard.queues, self.name())?;

        let before = tables.ready.len() + tables.scheduled.len();
        tables.ready.retain(|row| !row.is_expired(now));
        tables.scheduled.retain(|_, scheduled| !scheduled.row.is_expired(now));
        let after = tables.ready.len() + tables.scheduled.len();

        Ok((before - after) as u64)
    }

    async fn pop_direct(&self, max: i64) -> Result<Vec<Envelope>, QueueError> {
        if max <= 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<QueueRow> = {
            let mut guard = self.store.lock();
            let tables = tables_mut(&mut guard.queues, self.name())?;
            let take = usize::try_from(max).unwrap_or(usize::MAX).min(tables.ready.len());
            tables.ready.drain(..take).collect()
        };

        Ok(rows.into_iter().map(|row| self.decode(row)).collect())
    }

    async fn pop_to_inbox(&self, max: i64, node: NodeId) -> Result<Vec<Envelope>, QueueError> {
        if max <= 0 {
            return Ok(Vec::new());
        }
        let now = self.now();

        let rows: Vec<QueueRow> = {
            let mut guard = self.store.lock();
            let state = &mut *guard;
            let tables = tables_mut(&mut state.queues, self.name())?;
            let inbox = &mut state.inbox;

            let before = tables.ready.len();
            tables.ready.retain(|row| !inbox.contains_key(&row.id));
            let cleaned = before - tables.ready.len();
            if cleaned > 0 {
                debug!(queue = %self.uri, cleaned, "Removed ready rows already in the inbox");
            }

            let take = usize::try_from(max).unwrap_or(usize::MAX).min(tables.ready.len());
            let rows: Vec<QueueRow> = tables.ready.drain(..take).collect();
            for row in &rows {
                inbox.entry(row.id).or_insert_with(|| InboxRow {
                    id: row.id,
                    status: InboxStatus::Incoming,
                    owner: node,
                    body: row.body.clone(),
                    message_type: row.message_type.clone(),
                    destination: self.uri.clone(),
                    received_at: now,
                    keep_until: row.keep_until,
                    attempts: 0,
                });
            }
            rows
        };

        Ok(rows.into_iter().map(|row| self.decode(row)).collect())
    }

    async fn schedule_retry(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let execution_time = envelope
            .scheduled_time
            .ok_or(QueueError::MissingScheduledTime { id: envelope.id })?;

        let mut guard = self.store.lock();
        let state = &mut *guard;
        let tables = tables_mut(&mut state.queues, self.name())?;
        let row = self.row_for(envelope, next_seq(&mut state.sequence))?;
        state.inbox.remove(&envelope.id);
        tables.upsert_scheduled(row, execution_time);
        Ok(())
    }

    async fn count(&self) -> Result<i64, QueueError> {
        let mut guard = self.store.lock();
        let tables = tables_mut(&mut guard.queues, self.name())?;
        Ok(tables.ready.len() as i64)
    }

    async fn scheduled_count(&self) -> Result<i64, QueueError> {
        let mut guard = self.store.lock();
        let tables = tables_mut(&mut guard.queues, self.name())?;
        Ok(tables.scheduled.len() as i64)
    }
}

#[async_trait]
impl QueueAdmin for InMemoryQueue {
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
        let mut guard = self.store.lock();
        let tables = tables_mut(&mut guard.queues, self.name())?;
        tables.ready.clear();
        tables.scheduled.clear();
        info!(queue = %self.uri, "Queue purged");
        Ok(())
    }

    async fn setup(&self) -> Result<(), QueueError> {
        self.store
            .lock()
            .queues
            .entry(self.name().to_string())
            .or_default();
        Ok(())
    }

    async fn teardown(&self) -> Result<(), QueueError> {
        self.store.lock().queues.remove(self.name());
        info!(queue = %self.uri, "Queue torn down");
        Ok(())
    }

    async fn check(&self) -> Result<bool, QueueError> {
        Ok(self.store.lock().queues.contains_key(self.name()))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Creates and routes to in-memory queues, one shared instance per name.
#[derive(Debug)]
pub struct InMemoryTransport {
    store: Arc<InMemoryEnvelopeStore>,
    config: TransportConfig,
    queues: RwLock<HashMap<String, Arc<InMemoryQueue>>>,
}

impl InMemoryTransport {
    pub fn new(store: Arc<InMemoryEnvelopeStore>, config: TransportConfig) -> Self {
        Self {
            store,
            config,
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<InMemoryEnvelopeStore> {
        &self.store
    }

    /// The queue named `name`, created on first use.
    pub fn queue(&self, name: &str) -> Result<Arc<InMemoryQueue>, QueueError> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
        {
            return Ok(queue.clone());
        }

        let created = Arc::new(InMemoryQueue::new(name, self.store.clone(), &self.config)?);
        let mut queues = self.queues.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(queues.entry(name.to_string()).or_insert(created).clone())
    }

    /// Every queue created so far, ordered by name.
    pub fn queues(&self) -> Vec<Arc<InMemoryQueue>> {
        let queues = self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<Arc<InMemoryQueue>> = queues.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub async fn initialize(&self) -> Result<(), QueueError> {
        for queue in self.queues() {
            queue.initialize().await?;
        }
        Ok(())
    }
}

impl QueueRouter for InMemoryTransport {
    fn queue_for(&self, destination: &QueueUri) -> Option<Arc<dyn DurableQueue>> {
        if destination.protocol() != MEMORY_PROTOCOL {
            return None;
        }
        let queues = self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .get(destination.name())
            .map(|queue| queue.clone() as Arc<dyn DurableQueue>)
    }
}

// ============================================================================
// SESSIONS
// ============================================================================

/// Opens [`InMemorySession`]s for one node.
#[derive(Debug, Clone)]
pub struct InMemorySessionFactory {
    store: Arc<InMemoryEnvelopeStore>,
    node: NodeId,
}

impl InMemorySessionFactory {
    pub fn new(store: Arc<InMemoryEnvelopeStore>, node: NodeId) -> Self {
        Self { store, node }
    }
}

#[async_trait]
impl SessionFactory for InMemorySessionFactory {
    type Session = InMemorySession;

    async fn open(&self) -> Result<InMemorySession, QueueError> {
        Ok(InMemorySession {
            store: self.store.clone(),
            node: self.node,
            staged: Vec::new(),
        })
    }
}

/// Stages envelopes until commit; nothing is visible before that.
#[derive(Debug)]
pub struct InMemorySession {
    store: Arc<InMemoryEnvelopeStore>,
    node: NodeId,
    staged: Vec<Envelope>,
}

#[async_trait]
impl UnitOfWork for InMemorySession {
    async fn publish(&mut self, envelope: Envelope) -> Result<(), QueueError> {
        if envelope.destination.is_none() {
            return Err(QueueError::MissingDestination { id: envelope.id });
        }
        self.staged.push(envelope);
        Ok(())
    }

    async fn commit(self) -> Result<Vec<PendingMove>, QueueError> {
        self.store.store_outgoing(&self.staged, self.node)
    }

    async fn rollback(self) -> Result<(), QueueError> {
        debug!(discarded = self.staged.len(), "Session rolled back");
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use keel_core::{ManualClock, SerializationError};
    use std::collections::HashSet;

    struct Fixture {
        transport: InMemoryTransport,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_serializer(Arc::new(JsonEnvelopeSerializer))
        }

        fn with_serializer(serializer: Arc<dyn EnvelopeSerializer>) -> Self {
            let clock = ManualClock::new(Utc::now());
            let store = Arc::new(InMemoryEnvelopeStore::new(serializer, Arc::new(clock.clone())));
            Self {
                transport: InMemoryTransport::new(store, TransportConfig::default()),
                clock,
            }
        }

        async fn queue(&self, name: &str) -> Arc<InMemoryQueue> {
            let queue = self.transport.queue(name).unwrap();
            queue.initialize().await.unwrap();
            queue
        }

        fn uri(&self, name: &str) -> QueueUri {
            QueueUri::new(MEMORY_PROTOCOL, name).unwrap()
        }
    }

    fn envelope(data: &[u8]) -> Envelope {
        Envelope::new("OrderPlaced", data.to_vec())
    }

    /// Refuses to deserialize envelopes whose type is "poison".
    struct PoisonAwareSerializer;

    impl EnvelopeSerializer for PoisonAwareSerializer {
        fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializationError> {
            JsonEnvelopeSerializer.serialize(envelope)
        }

        fn deserialize(&self, data: &[u8]) -> Result<Envelope, SerializationError> {
            let envelope = JsonEnvelopeSerializer.deserialize(data)?;
            if envelope.message_type == "poison" {
                return Err(SerializationError::Deserialize {
                    len: data.len(),
                    reason: "poisoned payload".to_string(),
                });
            }
            Ok(envelope)
        }
    }

    #[tokio::test]
    async fn test_enqueue_ready_keeps_first_write() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let first = envelope(b"first");
        let second = Envelope {
            data: b"second".to_vec(),
            ..first.clone()
        };

        assert_eq!(queue.enqueue_ready(&first).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(
            queue.enqueue_ready(&second).await.unwrap(),
            EnqueueOutcome::AlreadyEnqueued
        );
        assert_eq!(queue.count().await.unwrap(), 1);

        let popped = queue.pop_direct(10).await.unwrap();
        assert_eq!(popped[0].data, b"first".to_vec());
    }

    #[tokio::test]
    async fn test_enqueue_scheduled_keeps_last_write() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let now = fixture.clock.now();
        let first = envelope(b"first").with_scheduled_time(now + Duration::minutes(10));
        let second = Envelope {
            data: b"second".to_vec(),
            scheduled_time: Some(now + Duration::minutes(1)),
            ..first.clone()
        };

        queue.enqueue_scheduled(&first).await.unwrap();
        queue.enqueue_scheduled(&second).await.unwrap();
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);

        fixture.clock.advance(Duration::minutes(2));
        assert_eq!(queue.sweep_scheduled_to_ready().await.unwrap(), 1);
        let popped = queue.pop_direct(1).await.unwrap();
        assert_eq!(popped[0].data, b"second".to_vec());
    }

    #[tokio::test]
    async fn test_enqueue_scheduled_requires_time() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let err = queue.enqueue_scheduled(&envelope(b"x")).await.unwrap_err();
        assert!(matches!(err, QueueError::MissingScheduledTime { .. }));
        assert!(err.is_hard());
    }

    #[tokio::test]
    async fn test_send_routes_by_schedule() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let now = fixture.clock.now();

        queue.send(&envelope(b"now")).await.unwrap();
        queue
            .send(&envelope(b"later").with_scheduled_time(now + Duration::minutes(5)))
            .await
            .unwrap();
        queue
            .send(&envelope(b"past").with_scheduled_time(now - Duration::minutes(5)))
            .await
            .unwrap();

        assert_eq!(queue.count().await.unwrap(), 2);
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_move_outgoing_to_ready() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let store = fixture.transport.store();
        let message = envelope(b"x").with_destination(fixture.uri("orders"));
        store.store_outgoing(&[message.clone()], NodeId::new()).unwrap();

        assert_eq!(queue.move_outgoing_to_ready(message.id).await.unwrap(), MoveOutcome::Moved);
        assert!(store.outgoing(message.id).is_none());
        assert_eq!(queue.count().await.unwrap(), 1);

        let err = queue.move_outgoing_to_ready(message.id).await.unwrap_err();
        assert!(matches!(err, QueueError::NoMatchingOutgoing { .. }));
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_move_with_existing_destination_cleans_outgoing() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let store = fixture.transport.store();
        let now = fixture.clock.now();
        let message = envelope(b"x")
            .with_destination(fixture.uri("orders"))
            .with_scheduled_time(now + Duration::minutes(5));

        queue.enqueue_scheduled(&message).await.unwrap();
        store.store_outgoing(&[message.clone()], NodeId::new()).unwrap();

        let outcome = queue
            .move_outgoing_to_scheduled(message.id, now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(outcome, MoveOutcome::AlreadyMoved);
        assert!(store.outgoing(message.id).is_none());
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);

        queue.enqueue_ready(&message).await.unwrap();
        store.store_outgoing(&[message.clone()], NodeId::new()).unwrap();
        assert_eq!(
            queue.move_outgoing_to_ready(message.id).await.unwrap(),
            MoveOutcome::AlreadyMoved
        );
        assert_eq!(store.outgoing_count(), 0);
    }

    #[tokio::test]
    async fn test_move_leaves_state_unchanged_when_queue_missing() {
        let fixture = Fixture::new();
        let queue = fixture.transport.queue("unprovisioned").unwrap();
        let store = fixture.transport.store();
        let message = envelope(b"x").with_destination(fixture.uri("unprovisioned"));
        store.store_outgoing(&[message.clone()], NodeId::new()).unwrap();

        let err = queue.move_outgoing_to_ready(message.id).await.unwrap_err();
        assert!(matches!(err, QueueError::Schema { .. }));
        assert!(store.outgoing(message.id).is_some());
    }

    #[tokio::test]
    async fn test_sweep_promotes_only_due_rows() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let now = fixture.clock.now();
        let soon = envelope(b"soon").with_scheduled_time(now + Duration::minutes(5));
        let later = envelope(b"later").with_scheduled_time(now + Duration::hours(1));
        queue.enqueue_scheduled(&soon).await.unwrap();
        queue.enqueue_scheduled(&later).await.unwrap();

        assert_eq!(queue.sweep_scheduled_to_ready().await.unwrap(), 0);
        assert!(queue.pop_direct(10).await.unwrap().is_empty());

        fixture.clock.advance(Duration::minutes(5));
        assert_eq!(queue.sweep_scheduled_to_ready().await.unwrap(), 1);
        let popped = queue.pop_direct(10).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].id, soon.id);
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_ids_already_ready() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let now = fixture.clock.now();
        let message = envelope(b"x").with_scheduled_time(now - Duration::seconds(1));

        queue.enqueue_ready(&message).await.unwrap();
        queue.enqueue_scheduled(&message).await.unwrap();

        assert_eq!(queue.sweep_scheduled_to_ready().await.unwrap(), 0);
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let now = fixture.clock.now();
        let expired = envelope(b"old").with_keep_until(now - Duration::seconds(1));
        let fresh = envelope(b"new").with_keep_until(now + Duration::hours(1));
        let expired_scheduled = envelope(b"old")
            .with_keep_until(now - Duration::seconds(1))
            .with_scheduled_time(now + Duration::minutes(1));

        queue.enqueue_ready(&expired).await.unwrap();
        queue.enqueue_ready(&fresh).await.unwrap();
        queue.enqueue_scheduled(&expired_scheduled).await.unwrap();

        assert_eq!(queue.delete_expired().await.unwrap(), 2);
        let popped = queue.pop_direct(10).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].id, fresh.id);
    }

    #[tokio::test]
    async fn test_pop_direct_is_fifo_and_bounded() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let messages: Vec<Envelope> = (0u8..5).map(|i| envelope(&[i])).collect();
        for message in &messages {
            queue.enqueue_ready(message).await.unwrap();
        }

        let first = queue.pop_direct(2).await.unwrap();
        let rest = queue.pop_direct(10).await.unwrap();
        let ids: Vec<MessageId> = first.iter().chain(rest.iter()).map(|e| e.id).collect();
        let expected: Vec<MessageId> = messages.iter().map(|e| e.id).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(ids, expected);
        assert!(queue.pop_direct(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_max_is_noop() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        queue.enqueue_ready(&envelope(b"x")).await.unwrap();

        assert!(queue.pop_direct(0).await.unwrap().is_empty());
        assert!(queue.pop_direct(-3).await.unwrap().is_empty());
        assert!(queue.pop_to_inbox(0, NodeId::new()).await.unwrap().is_empty());
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_to_inbox_tags_owner() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let node = NodeId::new();
        let message = envelope(b"x");
        queue.enqueue_ready(&message).await.unwrap();

        let popped = queue.pop_to_inbox(5, node).await.unwrap();
        assert_eq!(popped.len(), 1);

        let row = fixture.transport.store().inbox(message.id).unwrap();
        assert_eq!(row.owner, node);
        assert_eq!(row.status, InboxStatus::Incoming);
        assert_eq!(row.destination, fixture.uri("orders"));
        assert_eq!(row.received_at, fixture.clock.now());
        assert_eq!(queue.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_to_inbox_cleans_rows_left_by_crashed_handoff() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let node = NodeId::new();
        let stale = envelope(b"stale").with_destination(fixture.uri("orders"));
        let fresh = envelope(b"fresh");

        queue.enqueue_ready(&stale).await.unwrap();
        queue.enqueue_ready(&fresh).await.unwrap();
        fixture.transport.store().store_incoming(&stale, node).unwrap();

        let popped = queue.pop_to_inbox(10, node).await.unwrap();
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].id, fresh.id);
        assert_eq!(queue.count().await.unwrap(), 0);
        assert_eq!(fixture.transport.store().inbox_for(node).len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_body_becomes_placeholder() {
        let fixture = Fixture::with_serializer(Arc::new(PoisonAwareSerializer));
        let queue = fixture.queue("orders").await;
        queue.enqueue_ready(&Envelope::new("poison", vec![])).await.unwrap();
        queue.enqueue_ready(&envelope(b"ok")).await.unwrap();

        let popped = queue.pop_direct(10).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert!(popped[0].is_ping());
        assert_eq!(popped[0].destination, Some(fixture.uri("orders")));
        assert_eq!(popped[1].data, b"ok".to_vec());
    }

    #[tokio::test]
    async fn test_schedule_retry_moves_inbox_row_to_scheduled() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        let node = NodeId::new();
        let message = envelope(b"x");
        queue.enqueue_ready(&message).await.unwrap();
        let mut popped = queue.pop_to_inbox(1, node).await.unwrap();

        let mut retry = popped.remove(0);
        retry.attempts += 1;
        retry.scheduled_time = Some(fixture.clock.now() + Duration::seconds(30));
        queue.schedule_retry(&retry).await.unwrap();

        assert!(fixture.transport.store().inbox(message.id).is_none());
        assert_eq!(queue.scheduled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_batch_follows_mode() {
        let fixture = Fixture::new();
        let node = NodeId::new();
        let durable = fixture.queue("durable").await;
        durable.enqueue_ready(&envelope(b"x")).await.unwrap();
        durable.pop_batch(node).await.unwrap();
        assert_eq!(fixture.transport.store().inbox_for(node).len(), 1);

        let store = fixture.transport.store().clone();
        let buffered = InMemoryQueue::new("durable", store.clone(), &TransportConfig::default())
            .unwrap()
            .with_mode(EndpointMode::BufferedInMemory);
        buffered.enqueue_ready(&envelope(b"y")).await.unwrap();
        assert_eq!(buffered.pop_batch(node).await.unwrap().len(), 1);
        assert_eq!(store.inbox_for(node).len(), 1);

        let inline = InMemoryQueue::new("durable", store, &TransportConfig::default())
            .unwrap()
            .with_mode(EndpointMode::Inline);
        assert!(matches!(
            inline.pop_batch(node).await,
            Err(QueueError::UnsupportedMode { .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let store = Arc::new(InMemoryEnvelopeStore::default());
        let config = TransportConfig {
            auto_purge_all_queues: true,
            ..TransportConfig::default()
        };
        let transport = InMemoryTransport::new(store, config);
        let queue = transport.queue("orders").unwrap();

        queue.initialize().await.unwrap();
        queue.enqueue_ready(&envelope(b"x")).await.unwrap();
        queue.initialize().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_admin_lifecycle_and_attributes() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        assert!(queue.check().await.unwrap());

        queue.enqueue_ready(&envelope(b"x")).await.unwrap();
        let attributes = queue.attributes().await.unwrap();
        assert_eq!(attributes.name, "orders");
        assert_eq!(attributes.count, 1);
        assert_eq!(attributes.scheduled, 0);

        queue.purge().await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 0);

        queue.teardown().await.unwrap();
        assert!(!queue.check().await.unwrap());
        assert!(queue.count().await.is_err());
    }

    #[tokio::test]
    async fn test_transport_shares_instances_and_routes() {
        let fixture = Fixture::new();
        let first = fixture.transport.queue("orders").unwrap();
        let second = fixture.transport.queue("orders").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(fixture.transport.queue("bad name").is_err());

        assert!(fixture.transport.queue_for(&fixture.uri("orders")).is_some());
        assert!(fixture.transport.queue_for(&fixture.uri("missing")).is_none());
        let foreign = QueueUri::new("postgresql", "orders").unwrap();
        assert!(fixture.transport.queue_for(&foreign).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pops_never_overlap() {
        let fixture = Fixture::new();
        let queue = fixture.queue("orders").await;
        for i in 0..200u32 {
            queue.enqueue_ready(&envelope(&i.to_be_bytes())).await.unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let batch = if worker % 2 == 0 {
                        queue.pop_direct(7).await.unwrap()
                    } else {
                        queue.pop_to_inbox(7, NodeId::new()).await.unwrap()
                    };
                    if batch.is_empty() {
                        break;
                    }
                    seen.extend(batch.into_iter().map(|e| e.id));
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<MessageId> = all.iter().copied().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }
}
