//! Driver error mapping
//!
//! Driver and pool errors are logged in full here and reduced to
//! [`QueueError`] values that carry the failed operation's name.

use deadpool_postgres::PoolError;
use keel_core::QueueError;
use tokio_postgres::error::SqlState;

/// True for a duplicate-key conflict, the idempotent success path.
pub fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

/// Convert a driver error raised by `operation`.
pub fn database_error(operation: &str, err: tokio_postgres::Error) -> QueueError {
    tracing::error!(operation, error = ?err, "Database error");
    QueueError::Database {
        operation: operation.to_string(),
        reason: err
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| err.to_string()),
    }
}

/// Convert a connection pool error.
pub fn pool_error(err: PoolError) -> QueueError {
    tracing::error!(error = ?err, "Connection pool error");

    let reason = match err {
        PoolError::Timeout(_) => "connection pool exhausted".to_string(),
        PoolError::Closed => "connection pool is closed".to_string(),
        other => format!("failed to acquire database connection: {}", other),
    };
    QueueError::Pool { reason }
}

/// Attach an operation name to driver results.
pub trait DbResultExt<T> {
    fn db(self, operation: &str) -> Result<T, QueueError>;
}

impl<T> DbResultExt<T> for Result<T, tokio_postgres::Error> {
    fn db(self, operation: &str) -> Result<T, QueueError> {
        self.map_err(|e| database_error(operation, e))
    }
}
