//! Persistence for cellflow tables, records and the recompute outbox.
//!
//! The engine talks to storage through four narrow traits
//! ([`RecordStore`], [`ReferenceStore`], [`SchemaStore`], [`OutboxStore`]);
//! [`SqliteStore`] implements all of them over a single connection.
//!
//! # Modules
//!
//! - [`error`]: StorageError enum with all failure modes
//! - [`types`]: record rows, outbox tasks and their status
//! - [`codec`]: cell value <-> SQLite column conversion
//! - [`traits`]: the store contracts
//! - [`schema`]: connection setup and metadata migrations
//! - [`sqlite`]: SqliteStore implementation

pub mod codec;
pub mod error;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use codec::{encode, ColumnCodec};
pub use error::StorageError;
pub use sqlite::SqliteStore;
pub use traits::{OutboxStore, RecordStore, ReferenceStore, SchemaStore};
pub use types::{ComputedUpdateTask, RecordRow, TaskStatus};
