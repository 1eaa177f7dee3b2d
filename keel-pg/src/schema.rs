//! Table definitions, DDL and schema-drift detection.
//!
//! Names are validated SQL identifiers before they reach this module, so
//! they are interpolated without quoting.

use crate::error::DbResultExt;
use keel_core::QueueError;
use std::fmt;
use tokio_postgres::Client;

/// Shared table of envelopes written by producer transactions.
pub const OUTGOING_TABLE: &str = "keel_outgoing_envelopes";

/// Shared table of envelopes handed to a node for processing.
pub const INCOMING_TABLE: &str = "keel_incoming_envelopes";

// ============================================================================
// COLUMNS
// ============================================================================

/// Column types used by the queue tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Uuid,
    Bytes,
    Text,
    Timestamp,
    Integer,
}

impl ColumnType {
    fn ddl(&self) -> &'static str {
        match self {
            ColumnType::Uuid => "uuid",
            ColumnType::Bytes => "bytea",
            ColumnType::Text => "varchar",
            ColumnType::Timestamp => "timestamptz",
            ColumnType::Integer => "integer",
        }
    }

    /// Name reported by `information_schema.columns.data_type`.
    fn information_schema_name(&self) -> &'static str {
        match self {
            ColumnType::Uuid => "uuid",
            ColumnType::Bytes => "bytea",
            ColumnType::Text => "character varying",
            ColumnType::Timestamp => "timestamp with time zone",
            ColumnType::Integer => "integer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<&'static str>,
}

impl ColumnDefinition {
    const fn required(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            default: None,
        }
    }

    const fn optional(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: true,
            default: None,
        }
    }

    const fn defaulted(name: &'static str, column_type: ColumnType, default: &'static str) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
            default: Some(default),
        }
    }

    fn ddl(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.column_type.ddl());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// A column as it exists in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

// ============================================================================
// TABLES
// ============================================================================

/// Expected shape of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
}

impl TableDefinition {
    /// Ready table of one queue.
    pub fn queue(schema: &str, name: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: name.to_string(),
            columns: vec![
                ColumnDefinition::required("id", ColumnType::Uuid),
                ColumnDefinition::required("body", ColumnType::Bytes),
                ColumnDefinition::required("message_type", ColumnType::Text),
                ColumnDefinition::optional("keep_until", ColumnType::Timestamp),
                ColumnDefinition::defaulted("enqueued_at", ColumnType::Timestamp, "clock_timestamp()"),
            ],
        }
    }

    /// Scheduled table of one queue.
    pub fn scheduled(schema: &str, name: &str) -> Self {
        let mut table = Self::queue(schema, name);
        table
            .columns
            .push(ColumnDefinition::required("execution_time", ColumnType::Timestamp));
        table
    }

    pub fn outgoing(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: OUTGOING_TABLE.to_string(),
            columns: vec![
                ColumnDefinition::required("id", ColumnType::Uuid),
                ColumnDefinition::required("owner_id", ColumnType::Uuid),
                ColumnDefinition::required("destination", ColumnType::Text),
                ColumnDefinition::optional("deliver_by", ColumnType::Timestamp),
                ColumnDefinition::required("body", ColumnType::Bytes),
                ColumnDefinition::required("message_type", ColumnType::Text),
                ColumnDefinition::defaulted("attempts", ColumnType::Integer, "0"),
            ],
        }
    }

    pub fn incoming(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            name: INCOMING_TABLE.to_string(),
            columns: vec![
                ColumnDefinition::required("id", ColumnType::Uuid),
                ColumnDefinition::required("status", ColumnType::Text),
                ColumnDefinition::required("owner_node_id", ColumnType::Uuid),
                ColumnDefinition::required("body", ColumnType::Bytes),
                ColumnDefinition::required("message_type", ColumnType::Text),
                ColumnDefinition::required("destination", ColumnType::Text),
                ColumnDefinition::defaulted("received_at", ColumnType::Timestamp, "now()"),
                ColumnDefinition::optional("keep_until", ColumnType::Timestamp),
                ColumnDefinition::defaulted("attempts", ColumnType::Integer, "0"),
            ],
        }
    }

    /// `schema.name`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(ColumnDefinition::ddl).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY (id))",
            self.qualified_name(),
            columns.join(", ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.qualified_name())
    }

    /// Statements adding columns absent from `existing`.
    ///
    /// New required columns without a default are added as nullable, since
    /// the table may already hold rows.
    pub fn migration_sql(&self, existing: &[ExistingColumn]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|column| !existing.iter().any(|e| e.name == column.name))
            .map(|column| {
                let mut added = column.clone();
                if added.default.is_none() {
                    added.nullable = true;
                }
                format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                    self.qualified_name(),
                    added.ddl()
                )
            })
            .collect()
    }

    /// Compare the expected shape with the database's.
    pub fn drift(&self, existing: &[ExistingColumn]) -> SchemaDrift {
        if existing.is_empty() {
            return SchemaDrift::MissingTable;
        }

        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        for column in &self.columns {
            match existing.iter().find(|e| e.name == column.name) {
                None => missing.push(column.name.to_string()),
                Some(found) if found.data_type != column.column_type.information_schema_name() => {
                    mismatched.push(format!(
                        "{} is {}, expected {}",
                        column.name,
                        found.data_type,
                        column.column_type.information_schema_name()
                    ));
                }
                Some(_) => {}
            }
        }

        if missing.is_empty() && mismatched.is_empty() {
            SchemaDrift::None
        } else {
            SchemaDrift::Columns {
                missing,
                mismatched,
            }
        }
    }

    /// Read this table's columns from `information_schema`.
    pub async fn existing_columns(&self, client: &Client) -> Result<Vec<ExistingColumn>, QueueError> {
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text, is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2",
                &[&self.schema, &self.name],
            )
            .await
            .db("read_columns")?;

        rows.iter()
            .map(|row| {
                let nullable: String = row.try_get(2).db("read_columns")?;
                Ok(ExistingColumn {
                    name: row.try_get(0).db("read_columns")?,
                    data_type: row.try_get(1).db("read_columns")?,
                    nullable: nullable == "YES",
                })
            })
            .collect()
    }

    /// Create the table if missing and add any missing columns.
    pub async fn apply(&self, client: &Client) -> Result<(), QueueError> {
        client
            .batch_execute(&self.create_sql())
            .await
            .db("create_table")?;

        let existing = self.existing_columns(client).await?;
        for statement in self.migration_sql(&existing) {
            tracing::info!(table = %self.qualified_name(), %statement, "Migrating table");
            client.batch_execute(&statement).await.db("migrate_table")?;
        }
        Ok(())
    }

    /// Report drift, logging any difference.
    pub async fn check(&self, client: &Client) -> Result<SchemaDrift, QueueError> {
        let drift = self.drift(&self.existing_columns(client).await?);
        if drift != SchemaDrift::None {
            tracing::warn!(table = %self.qualified_name(), %drift, "Schema drift detected");
        }
        Ok(drift)
    }
}

/// `CREATE SCHEMA IF NOT EXISTS` for `schema`.
pub fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", schema)
}

// ============================================================================
// DRIFT
// ============================================================================

/// Difference between expected and actual table shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaDrift {
    None,
    MissingTable,
    Columns {
        missing: Vec<String>,
        mismatched: Vec<String>,
    },
}

impl fmt::Display for SchemaDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDrift::None => f.write_str("none"),
            SchemaDrift::MissingTable => f.write_str("table is missing"),
            SchemaDrift::Columns {
                missing,
                mismatched,
            } => write!(
                f,
                "missing columns [{}], mismatched columns [{}]",
                missing.join(", "),
                mismatched.join("; ")
            ),
        }
    }
}
