//! Engine error type.
//!
//! [`EngineError`] wraps the errors of the crates below it, so engine
//! operations can use `?` across layers. Validation, invariant and cycle
//! errors reach the caller unchanged inside [`EngineError::Core`].

use thiserror::Error;

use cellflow_core::CoreError;
use cellflow_sql::SqlError;
use cellflow_storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A table, field or record named by the caller does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is well-formed but not allowed.
    #[error("rejected: {0}")]
    Rejected(String),

    /// An environment variable or flag holds an invalid value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background worker task stopped abnormally.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl EngineError {
    /// Whether the error is a rejection of the caller's input rather than a
    /// failure of the engine.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::Core(
                CoreError::Validation { .. }
                    | CoreError::InvalidId { .. }
                    | CoreError::InvariantViolation { .. }
                    | CoreError::DependencyCycle { .. }
                    | CoreError::Formula(_)
            ) | EngineError::Rejected(_)
                | EngineError::NotFound(_)
        )
    }
}
