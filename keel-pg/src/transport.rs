//! PostgreSQL transport: queue factory, router and shared envelope tables.

use crate::db::{connection, DbConfig};
use crate::error::DbResultExt;
use crate::queue::PostgresQueue;
use crate::schema::{create_schema_sql, SchemaDrift, TableDefinition};
use crate::session::PgSessionFactory;
use deadpool_postgres::Pool;
use keel_core::{
    EnvelopeSerializer, JsonEnvelopeSerializer, NodeId, QueueError, QueueUri, TransportConfig,
    POSTGRES_PROTOCOL,
};
use keel_storage::{DurableQueue, QueueAdmin, QueueRouter};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Owns the pool and every queue created through it.
pub struct PostgresTransport {
    pool: Pool,
    config: TransportConfig,
    serializer: Arc<dyn EnvelopeSerializer>,
    outgoing_table: TableDefinition,
    incoming_table: TableDefinition,
    queues: RwLock<HashMap<String, Arc<PostgresQueue>>>,
}

impl std::fmt::Debug for PostgresTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransport")
            .field("schema_name", &self.config.schema_name)
            .field("table_prefix", &self.config.table_prefix)
            .finish_non_exhaustive()
    }
}

impl PostgresTransport {
    pub fn new(
        pool: Pool,
        config: TransportConfig,
        serializer: Arc<dyn EnvelopeSerializer>,
    ) -> Result<Self, QueueError> {
        config.validate().map_err(|e| QueueError::Schema {
            table: config.schema_name.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            outgoing_table: TableDefinition::outgoing(&config.schema_name),
            incoming_table: TableDefinition::incoming(&config.schema_name),
            pool,
            config,
            serializer,
            queues: RwLock::new(HashMap::new()),
        })
    }

    /// Build a transport with its own pool and the JSON serializer.
    pub fn from_config(db: &DbConfig, config: TransportConfig) -> Result<Self, QueueError> {
        Self::new(db.create_pool()?, config, Arc::new(JsonEnvelopeSerializer))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The queue named `name`, created on first use.
    pub fn queue(&self, name: &str) -> Result<Arc<PostgresQueue>, QueueError> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
        {
            return Ok(queue.clone());
        }

        let created = Arc::new(PostgresQueue::new(
            name,
            self.pool.clone(),
            self.serializer.clone(),
            &self.config,
        )?);
        let mut queues = self.queues.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(queues.entry(name.to_string()).or_insert(created).clone())
    }

    /// Every queue created so far, ordered by name.
    pub fn queues(&self) -> Vec<Arc<PostgresQueue>> {
        let queues = self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<Arc<PostgresQueue>> = queues.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Sessions whose outgoing rows are owned by `node`.
    pub fn session_factory(&self, node: NodeId) -> PgSessionFactory {
        PgSessionFactory::new(
            self.pool.clone(),
            self.serializer.clone(),
            &self.outgoing_table.qualified_name(),
            node,
        )
    }

    /// Create the schema and the shared outgoing and inbox tables.
    pub async fn setup_envelope_tables(&self) -> Result<(), QueueError> {
        let client = connection(&self.pool).await?;
        client
            .batch_execute(&create_schema_sql(&self.config.schema_name))
            .await
            .db("setup_envelope_tables")?;
        self.outgoing_table.apply(&client).await?;
        self.incoming_table.apply(&client).await?;
        info!(schema = %self.config.schema_name, "Envelope tables ready");
        Ok(())
    }

    pub async fn teardown_envelope_tables(&self) -> Result<(), QueueError> {
        let client = connection(&self.pool).await?;
        for table in [&self.outgoing_table, &self.incoming_table] {
            client
                .batch_execute(&table.drop_sql())
                .await
                .db("teardown_envelope_tables")?;
        }
        info!(schema = %self.config.schema_name, "Envelope tables dropped");
        Ok(())
    }

    pub async fn check_envelope_tables(&self) -> Result<bool, QueueError> {
        let client = connection(&self.pool).await?;
        let outgoing = self.outgoing_table.check(&client).await?;
        let incoming = self.incoming_table.check(&client).await?;
        Ok(outgoing == SchemaDrift::None && incoming == SchemaDrift::None)
    }

    /// Provision shared tables when configured, then initialize every queue.
    pub async fn initialize(&self) -> Result<(), QueueError> {
        if self.config.auto_provision {
            self.setup_envelope_tables().await?;
        }
        for queue in self.queues() {
            queue.initialize().await?;
        }
        Ok(())
    }
}

impl QueueRouter for PostgresTransport {
    fn queue_for(&self, destination: &QueueUri) -> Option<Arc<dyn DurableQueue>> {
        if destination.protocol() != POSTGRES_PROTOCOL {
            return None;
        }
        let queues = self.queues.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .get(destination.name())
            .map(|queue| queue.clone() as Arc<dyn DurableQueue>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(config: TransportConfig) -> Result<PostgresTransport, QueueError> {
        PostgresTransport::from_config(&DbConfig::default(), config)
    }

    #[tokio::test]
    async fn test_one_instance_per_queue_name() {
        let transport = transport(TransportConfig::default()).unwrap();
        let first = transport.queue("orders").unwrap();
        let second = transport.queue("orders").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.queues().len(), 1);
    }

    #[tokio::test]
    async fn test_routes_only_postgres_uris() {
        let transport = transport(TransportConfig::default()).unwrap();
        transport.queue("orders").unwrap();

        let known = QueueUri::new(POSTGRES_PROTOCOL, "orders").unwrap();
        let unknown = QueueUri::new(POSTGRES_PROTOCOL, "invoices").unwrap();
        let foreign = QueueUri::new("memory", "orders").unwrap();
        assert!(transport.queue_for(&known).is_some());
        assert!(transport.queue_for(&unknown).is_none());
        assert!(transport.queue_for(&foreign).is_none());
    }

    #[tokio::test]
    async fn test_invalid_schema_rejected() {
        let config = TransportConfig {
            schema_name: "drop table".to_string(),
            ..TransportConfig::default()
        };
        assert!(matches!(transport(config), Err(QueueError::Schema { .. })));
    }
}
