//! KEEL PostgreSQL - Durable Queue Store
//!
//! Queue store, transport, unit-of-work session and background durability
//! task backed by PostgreSQL through deadpool-postgres.

pub mod db;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod schema;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use db::DbConfig;
pub use error::{is_unique_violation, DbResultExt};
pub use jobs::{durability_task, DurabilityMetrics, DurabilitySnapshot};
pub use queue::PostgresQueue;
pub use schema::{SchemaDrift, TableDefinition, INCOMING_TABLE, OUTGOING_TABLE};
pub use session::{PgSession, PgSessionFactory};
pub use telemetry::init_tracing;
pub use transport::PostgresTransport;
