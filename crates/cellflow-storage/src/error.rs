//! Storage error types for cellflow-storage.

use thiserror::Error;

use cellflow_core::{CoreError, RecordId, TableId};

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The SQLite driver reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// No table with the given id is stored.
    #[error("table not found: {0}")]
    TableNotFound(TableId),

    /// The record does not exist in the table.
    #[error("record not found: table={table}, record={record}")]
    RecordNotFound { table: TableId, record: RecordId },

    /// No outbox task with the given id exists.
    #[error("outbox task not found: {0}")]
    TaskNotFound(i64),

    /// Stored metadata could not be turned back into a valid schema.
    #[error("stored metadata is invalid: {0}")]
    Core(#[from] CoreError),

    /// A stored value does not fit the column's shape.
    #[error("integrity error: {reason}")]
    IntegrityError { reason: String },
}
