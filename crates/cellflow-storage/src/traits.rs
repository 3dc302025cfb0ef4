//! Storage contracts used by the engine.
//!
//! Four narrow traits instead of one wide one: record data, persisted
//! reference edges, schema metadata and the outbox queue. [`SqliteStore`]
//! implements all of them over one connection, so the engine can group a
//! mutation and its propagation in a single backend.
//!
//! The traits are synchronous; async callers move a store onto a blocking
//! thread.
//!
//! [`SqliteStore`]: crate::sqlite::SqliteStore

use std::time::Duration;

use cellflow_core::{
    CellValue, Field, FieldId, LinkDbConfig, RecordId, Reference, Schema, Table, TableId,
};

use crate::codec::ColumnCodec;
use crate::error::StorageError;
use crate::types::{ComputedUpdateTask, RecordRow, TaskStatus};

/// Physical record tables and their values.
pub trait RecordStore {
    // -------------------------------------------------------------------
    // DDL
    // -------------------------------------------------------------------

    /// Creates the physical table of `table` with one column per field.
    fn create_table_storage(&mut self, table: &Table) -> Result<(), StorageError>;

    fn drop_table_storage(&mut self, physical_name: &str) -> Result<(), StorageError>;

    /// Adds a nullable column; adding an existing column is a no-op.
    fn add_column(&mut self, physical_name: &str, column: &str) -> Result<(), StorageError>;

    /// Drops a column; dropping a missing column is a no-op.
    fn drop_column(&mut self, physical_name: &str, column: &str) -> Result<(), StorageError>;

    /// Creates a junction table with the two key columns.
    fn create_junction(
        &mut self,
        name: &str,
        self_key: &str,
        foreign_key: &str,
    ) -> Result<(), StorageError>;

    fn drop_junction(&mut self, name: &str) -> Result<(), StorageError>;

    // -------------------------------------------------------------------
    // Records and values
    // -------------------------------------------------------------------

    /// Inserts an empty record, assigning the next auto number.
    fn insert_record(&mut self, table: &Table, record_id: &RecordId) -> Result<(), StorageError>;

    /// Record ids of a table in auto-number order.
    fn record_ids(&self, table: &Table) -> Result<Vec<RecordId>, StorageError>;

    fn get_value(
        &self,
        schema: &Schema,
        table: &Table,
        record_id: &RecordId,
        field: &Field,
    ) -> Result<CellValue, StorageError>;

    /// All persisted values of one record.
    fn get_row(
        &self,
        schema: &Schema,
        table: &Table,
        record_id: &RecordId,
    ) -> Result<RecordRow, StorageError>;

    /// Persists `value` into `field`'s column of one record.
    fn set_column(
        &mut self,
        table: &Table,
        record_id: &RecordId,
        field: &Field,
        value: &CellValue,
    ) -> Result<(), StorageError>;

    /// Executes a compiled record query.
    ///
    /// The first column must be the record id; the remaining columns are
    /// decoded with `codecs`, in order.
    fn query_values(
        &self,
        sql: &str,
        params: &[String],
        codecs: &[ColumnCodec],
    ) -> Result<Vec<(RecordId, Vec<CellValue>)>, StorageError>;

    // -------------------------------------------------------------------
    // Link key storage
    // -------------------------------------------------------------------

    /// Foreign ids linked to `host`, in link order.
    fn linked_record_ids(
        &self,
        db: &LinkDbConfig,
        host: &RecordId,
    ) -> Result<Vec<RecordId>, StorageError>;

    /// Host ids linked to any of `foreign_ids`.
    fn hosts_linking_to(
        &self,
        db: &LinkDbConfig,
        foreign_ids: &[RecordId],
    ) -> Result<Vec<RecordId>, StorageError>;

    /// Replaces the foreign ids linked to `host`.
    fn set_links(
        &mut self,
        db: &LinkDbConfig,
        host: &RecordId,
        foreign_ids: &[RecordId],
    ) -> Result<(), StorageError>;
}

/// Persisted dependency edges (`to` depends on `from`).
pub trait ReferenceStore {
    /// Replaces every edge into `to_field` with edges from `froms`.
    fn replace_references(&mut self, to_field: &FieldId, froms: &[FieldId]) -> Result<(), StorageError>;

    /// Removes every edge into or out of `field`.
    fn delete_references_of(&mut self, field: &FieldId) -> Result<(), StorageError>;

    /// Fields with an edge from `field`.
    fn dependents_of(&self, field: &FieldId) -> Result<Vec<FieldId>, StorageError>;

    fn all_references(&self) -> Result<Vec<Reference>, StorageError>;
}

/// Table and field metadata.
pub trait SchemaStore {
    /// Inserts or updates a table row and all of its fields.
    fn save_table(&mut self, table: &Table) -> Result<(), StorageError>;

    fn delete_table(&mut self, table_id: &TableId) -> Result<(), StorageError>;

    /// Inserts or updates one field at `position` within its table.
    fn save_field(&mut self, table_id: &TableId, field: &Field, position: usize) -> Result<(), StorageError>;

    fn delete_field(&mut self, field_id: &FieldId) -> Result<(), StorageError>;

    /// Loads every table in creation order with fields in position order.
    fn load_schema(&self) -> Result<Schema, StorageError>;
}

/// The deferred-recomputation queue.
pub trait OutboxStore {
    fn enqueue(
        &mut self,
        table_id: &TableId,
        record_id: &RecordId,
        field_ids: &[FieldId],
    ) -> Result<i64, StorageError>;

    /// Atomically claims up to `limit` pending tasks for `worker_id`.
    /// Tasks claimed by one worker are never returned to another.
    fn claim_batch(&mut self, worker_id: &str, limit: usize) -> Result<Vec<ComputedUpdateTask>, StorageError>;

    /// Removes a processed task from the queue.
    fn complete(&mut self, task_id: i64) -> Result<(), StorageError>;

    /// Records a failed attempt. The task returns to pending until
    /// `max_attempts` attempts have failed, then it is marked failed.
    fn fail(&mut self, task_id: i64, error: &str, max_attempts: u32) -> Result<TaskStatus, StorageError>;

    /// Returns a claimed task to pending without counting an attempt.
    fn release(&mut self, task_id: i64) -> Result<(), StorageError>;

    fn pending_count(&self) -> Result<usize, StorageError>;

    /// Returns tasks claimed longer than `older_than` ago to pending.
    fn reclaim_stale(&mut self, older_than: Duration) -> Result<usize, StorageError>;
}
