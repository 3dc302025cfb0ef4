//! Error types for SQL compilation.

use thiserror::Error;

use cellflow_core::{CoreError, FieldId, TableId};

/// Errors produced while compiling fields to SQL.
///
/// Compilation errors are per field: the record query builder renders a
/// failed field as `NULL` and reports the error next to the query.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SqlError {
    /// The main table was already captured with a different identity.
    #[error("main table already set to {existing}, refusing {requested}")]
    MainTableConflict { existing: String, requested: String },

    /// A referenced field does not exist.
    #[error("field not found: {id}")]
    MissingField { id: FieldId },

    /// A referenced table does not exist.
    #[error("table not found: {id}")]
    MissingTable { id: TableId },

    /// A link field has no key storage yet.
    #[error("link field {id} has no key storage")]
    LinkNotMaterialized { id: FieldId },

    /// The construct has no SQL rendering.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}
