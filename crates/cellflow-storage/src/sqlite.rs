//! SQLite implementation of the store traits.
//!
//! [`SqliteStore`] keeps metadata in the migrated `cf_*` tables and record
//! data in one physical table per user table. Multi-statement writes run
//! inside a savepoint, so they compose with an enclosing
//! [`SqliteStore::atomically`] block. Outbox claims use `BEGIN IMMEDIATE`
//! so that two workers never claim the same task.

use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use cellflow_core::link::{AUTO_NUMBER_COLUMN, ID_COLUMN};
use cellflow_core::{
    CellValue, Field, FieldId, FieldKind, LinkDbConfig, RecordId, Reference, Schema, Table, TableId,
};

use crate::codec::{encode, ColumnCodec};
use crate::error::StorageError;
use crate::traits::{OutboxStore, RecordStore, ReferenceStore, SchemaStore};
use crate::types::{ComputedUpdateTask, RecordRow, TaskStatus};

const SAVEPOINT: &str = "cellflow_atomic";

/// `"ident"`, with embedded quotes doubled.
fn q(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

fn parse_record_id(raw: String) -> Result<RecordId, StorageError> {
    Ok(RecordId::parse(raw)?)
}

/// SQLite-backed implementation of every store trait.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) a database file at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore { conn })
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` inside a savepoint: all of its writes commit together or
    /// not at all. Calls nest. The outermost call takes the write lock up
    /// front (`BEGIN IMMEDIATE`) so a read followed by a write never fails
    /// to upgrade while another connection holds the lock.
    pub fn atomically<T, E>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let outermost = self.conn.is_autocommit();
        let (begin, commit, rollback) = if outermost {
            (
                "BEGIN IMMEDIATE".to_string(),
                "COMMIT".to_string(),
                "ROLLBACK".to_string(),
            )
        } else {
            (
                format!("SAVEPOINT {SAVEPOINT}"),
                format!("RELEASE {SAVEPOINT}"),
                format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"),
            )
        };
        self.conn.execute_batch(&begin).map_err(StorageError::from)?;
        match f(self) {
            Ok(value) => {
                if let Err(err) = self.conn.execute_batch(&commit) {
                    if outermost && !self.conn.is_autocommit() {
                        if let Err(rollback_err) = self.conn.execute_batch(&rollback) {
                            warn!(error = %rollback_err, "rollback after failed commit failed");
                        }
                    }
                    return Err(StorageError::from(err).into());
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.conn.execute_batch(&rollback) {
                    warn!(error = %rollback_err, "rollback of failed write failed");
                }
                Err(err)
            }
        }
    }

    /// One outbox task by id.
    pub fn task(&self, task_id: i64) -> Result<Option<ComputedUpdateTask>, StorageError> {
        let raw = self
            .conn
            .prepare_cached(
                "SELECT id, table_id, record_id, field_ids_json, attempts, status, claimed_by, last_error \
                 FROM cf_outbox WHERE id = ?1",
            )?
            .query_row(params![task_id], RawTask::from_row)
            .optional()?;
        raw.map(RawTask::into_task).transpose()
    }

    fn column_exists(&self, physical_name: &str, column: &str) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
            params![physical_name, column],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn record_exists(&self, physical_name: &str, record_id: &RecordId) -> Result<bool, StorageError> {
        let exists: bool = self.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1)",
                q(physical_name),
                q(ID_COLUMN)
            ),
            params![record_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

impl RecordStore for SqliteStore {
    fn create_table_storage(&mut self, table: &Table) -> Result<(), StorageError> {
        let physical = table.db_table_name();
        let mut columns = vec![
            format!("{} TEXT PRIMARY KEY NOT NULL", q(ID_COLUMN)),
            format!("{} INTEGER NOT NULL", q(AUTO_NUMBER_COLUMN)),
        ];
        // Untyped columns keep values exactly as written.
        columns.extend(table.fields.iter().map(|f| q(f.db_field_name())));
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns});
             CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} ({auto});",
            table = q(physical),
            columns = columns.join(", "),
            index = q(&format!("idx_{physical}_auto_number")),
            auto = q(AUTO_NUMBER_COLUMN),
        ))?;
        debug!(table = %table.id, "created record table");
        Ok(())
    }

    fn drop_table_storage(&mut self, physical_name: &str) -> Result<(), StorageError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", q(physical_name)))?;
        Ok(())
    }

    fn add_column(&mut self, physical_name: &str, column: &str) -> Result<(), StorageError> {
        if self.column_exists(physical_name, column)? {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {}",
            q(physical_name),
            q(column)
        ))?;
        Ok(())
    }

    fn drop_column(&mut self, physical_name: &str, column: &str) -> Result<(), StorageError> {
        if !self.column_exists(physical_name, column)? {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            q(physical_name),
            q(column)
        ))?;
        Ok(())
    }

    fn create_junction(&mut self, name: &str, self_key: &str, foreign_key: &str) -> Result<(), StorageError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({id} INTEGER PRIMARY KEY AUTOINCREMENT, {sk} TEXT, {fk} TEXT);
             CREATE INDEX IF NOT EXISTS {sk_index} ON {table} ({sk});
             CREATE INDEX IF NOT EXISTS {fk_index} ON {table} ({fk});",
            table = q(name),
            id = q(ID_COLUMN),
            sk = q(self_key),
            fk = q(foreign_key),
            sk_index = q(&format!("idx_{name}_{self_key}")),
            fk_index = q(&format!("idx_{name}_{foreign_key}")),
        ))?;
        Ok(())
    }

    fn drop_junction(&mut self, name: &str) -> Result<(), StorageError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", q(name)))?;
        Ok(())
    }

    fn insert_record(&mut self, table: &Table, record_id: &RecordId) -> Result<(), StorageError> {
        let physical = q(table.db_table_name());
        let auto = q(AUTO_NUMBER_COLUMN);
        self.conn.execute(
            &format!(
                "INSERT INTO {physical} ({id}, {auto}) \
                 VALUES (?1, (SELECT COALESCE(MAX({auto}), 0) + 1 FROM {physical}))",
                id = q(ID_COLUMN),
            ),
            params![record_id.as_str()],
        )?;
        Ok(())
    }

    fn record_ids(&self, table: &Table) -> Result<Vec<RecordId>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY {}",
            q(ID_COLUMN),
            q(table.db_table_name()),
            q(AUTO_NUMBER_COLUMN)
        ))?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(parse_record_id).collect()
    }

    fn get_value(
        &self,
        schema: &Schema,
        table: &Table,
        record_id: &RecordId,
        field: &Field,
    ) -> Result<CellValue, StorageError> {
        let raw: Option<SqlValue> = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE {} = ?1",
                    q(field.db_field_name()),
                    q(table.db_table_name()),
                    q(ID_COLUMN)
                ),
                params![record_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| StorageError::RecordNotFound {
            table: table.id.clone(),
            record: record_id.clone(),
        })?;
        ColumnCodec::for_field(schema, field).decode(raw)
    }

    fn get_row(&self, schema: &Schema, table: &Table, record_id: &RecordId) -> Result<RecordRow, StorageError> {
        let mut row = RecordRow::new();
        if table.fields.is_empty() {
            if !self.record_exists(table.db_table_name(), record_id)? {
                return Err(StorageError::RecordNotFound {
                    table: table.id.clone(),
                    record: record_id.clone(),
                });
            }
            return Ok(row);
        }
        let columns: Vec<String> = table.fields.iter().map(|f| q(f.db_field_name())).collect();
        let raw: Option<Vec<SqlValue>> = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE {} = ?1",
                    columns.join(", "),
                    q(table.db_table_name()),
                    q(ID_COLUMN)
                ),
                params![record_id.as_str()],
                |r| (0..columns.len()).map(|i| r.get::<_, SqlValue>(i)).collect(),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| StorageError::RecordNotFound {
            table: table.id.clone(),
            record: record_id.clone(),
        })?;
        for (field, value) in table.fields.iter().zip(raw) {
            row.insert(field.id.clone(), ColumnCodec::for_field(schema, field).decode(value)?);
        }
        Ok(row)
    }

    fn set_column(
        &mut self,
        table: &Table,
        record_id: &RecordId,
        field: &Field,
        value: &CellValue,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                q(table.db_table_name()),
                q(field.db_field_name()),
                q(ID_COLUMN)
            ),
            params![encode(value)?, record_id.as_str()],
        )?;
        if changed == 0 {
            return Err(StorageError::RecordNotFound {
                table: table.id.clone(),
                record: record_id.clone(),
            });
        }
        Ok(())
    }

    fn query_values(
        &self,
        sql: &str,
        params: &[String],
        codecs: &[ColumnCodec],
    ) -> Result<Vec<(RecordId, Vec<CellValue>)>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let width = codecs.len();
        let raw = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                let id: String = row.get(0)?;
                let values = (1..=width)
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((id, values))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, values)| {
                let decoded = codecs
                    .iter()
                    .zip(values)
                    .map(|(codec, v)| codec.decode(v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((parse_record_id(id)?, decoded))
            })
            .collect()
    }

    fn linked_record_ids(&self, db: &LinkDbConfig, host: &RecordId) -> Result<Vec<RecordId>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {fk} FROM {table} WHERE {sk} = ?1 AND {fk} IS NOT NULL ORDER BY rowid",
            fk = q(&db.foreign_key_name),
            sk = q(&db.self_key_name),
            table = q(&db.fk_host_table_name),
        ))?;
        let raw = stmt
            .query_map(params![host.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(parse_record_id).collect()
    }

    fn hosts_linking_to(&self, db: &LinkDbConfig, foreign_ids: &[RecordId]) -> Result<Vec<RecordId>, StorageError> {
        if foreign_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!(
            "SELECT DISTINCT {sk} FROM {table} WHERE {fk} IN ({ph}) AND {sk} IS NOT NULL",
            fk = q(&db.foreign_key_name),
            sk = q(&db.self_key_name),
            table = q(&db.fk_host_table_name),
            ph = placeholders(foreign_ids.len()),
        ))?;
        let raw = stmt
            .query_map(params_from_iter(foreign_ids.iter().map(RecordId::as_str)), |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(parse_record_id).collect()
    }

    fn set_links(&mut self, db: &LinkDbConfig, host: &RecordId, foreign_ids: &[RecordId]) -> Result<(), StorageError> {
        let table = q(&db.fk_host_table_name);
        let sk = q(&db.self_key_name);
        let fk = q(&db.foreign_key_name);
        let id = q(ID_COLUMN);

        if db.self_key_name == ID_COLUMN {
            // Key column on the host row: at most one foreign record.
            if foreign_ids.len() > 1 {
                return Err(StorageError::IntegrityError {
                    reason: format!(
                        "{} can hold one link, got {}",
                        db.foreign_key_name,
                        foreign_ids.len()
                    ),
                });
            }
            self.conn.execute(
                &format!("UPDATE {table} SET {fk} = ?1 WHERE {id} = ?2"),
                params![foreign_ids.first().map(RecordId::as_str), host.as_str()],
            )?;
            return Ok(());
        }

        self.atomically(|store| -> Result<(), StorageError> {
            if db.foreign_key_name == ID_COLUMN {
                // Key column on the foreign rows.
                store.conn.execute(
                    &format!("UPDATE {table} SET {sk} = NULL WHERE {sk} = ?1"),
                    params![host.as_str()],
                )?;
                let mut stmt = store
                    .conn
                    .prepare(&format!("UPDATE {table} SET {sk} = ?1 WHERE {id} = ?2"))?;
                for foreign in foreign_ids {
                    stmt.execute(params![host.as_str(), foreign.as_str()])?;
                }
            } else {
                store.conn.execute(
                    &format!("DELETE FROM {table} WHERE {sk} = ?1"),
                    params![host.as_str()],
                )?;
                let mut stmt = store
                    .conn
                    .prepare(&format!("INSERT INTO {table} ({sk}, {fk}) VALUES (?1, ?2)"))?;
                for foreign in foreign_ids {
                    stmt.execute(params![host.as_str(), foreign.as_str()])?;
                }
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

impl ReferenceStore for SqliteStore {
    fn replace_references(&mut self, to_field: &FieldId, froms: &[FieldId]) -> Result<(), StorageError> {
        self.atomically(|store| -> Result<(), StorageError> {
            store.conn.execute(
                "DELETE FROM cf_references WHERE to_field_id = ?1",
                params![to_field.as_str()],
            )?;
            let mut stmt = store.conn.prepare_cached(
                "INSERT OR IGNORE INTO cf_references (from_field_id, to_field_id) VALUES (?1, ?2)",
            )?;
            for from in froms {
                stmt.execute(params![from.as_str(), to_field.as_str()])?;
            }
            Ok(())
        })
    }

    fn delete_references_of(&mut self, field: &FieldId) -> Result<(), StorageError> {
        self.conn.execute(
            "DELETE FROM cf_references WHERE from_field_id = ?1 OR to_field_id = ?1",
            params![field.as_str()],
        )?;
        Ok(())
    }

    fn dependents_of(&self, field: &FieldId) -> Result<Vec<FieldId>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT to_field_id FROM cf_references WHERE from_field_id = ?1 ORDER BY to_field_id",
        )?;
        let raw = stmt
            .query_map(params![field.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|id| Ok(FieldId::parse(id)?))
            .collect()
    }

    fn all_references(&self) -> Result<Vec<Reference>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT from_field_id, to_field_id FROM cf_references ORDER BY from_field_id, to_field_id",
        )?;
        let raw = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(from, to)| {
                Ok(Reference {
                    from_field_id: FieldId::parse(from)?,
                    to_field_id: FieldId::parse(to)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Schema metadata
// ---------------------------------------------------------------------------

impl SchemaStore for SqliteStore {
    fn save_table(&mut self, table: &Table) -> Result<(), StorageError> {
        self.atomically(|store| -> Result<(), StorageError> {
            store.conn.execute(
                "INSERT INTO cf_tables (id, name, db_table_name, created_seq) \
                 VALUES (?1, ?2, ?3, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM cf_tables)) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![table.id.as_str(), table.name, table.db_table_name()],
            )?;
            store.conn.execute(
                "DELETE FROM cf_fields WHERE table_id = ?1",
                params![table.id.as_str()],
            )?;
            for (position, field) in table.fields.iter().enumerate() {
                store.save_field(&table.id, field, position)?;
            }
            Ok(())
        })
    }

    fn delete_table(&mut self, table_id: &TableId) -> Result<(), StorageError> {
        let deleted = self
            .conn
            .execute("DELETE FROM cf_tables WHERE id = ?1", params![table_id.as_str()])?;
        if deleted == 0 {
            return Err(StorageError::TableNotFound(table_id.clone()));
        }
        Ok(())
    }

    fn save_field(&mut self, table_id: &TableId, field: &Field, position: usize) -> Result<(), StorageError> {
        let kind_json = serde_json::to_string(&field.kind)?;
        self.conn
            .prepare_cached(
                "INSERT INTO cf_fields (id, table_id, name, db_field_name, kind_json, has_error, is_primary, position) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(id) DO UPDATE SET table_id = excluded.table_id, name = excluded.name, \
                 kind_json = excluded.kind_json, has_error = excluded.has_error, \
                 is_primary = excluded.is_primary, position = excluded.position",
            )?
            .execute(params![
                field.id.as_str(),
                table_id.as_str(),
                field.name,
                field.db_field_name(),
                kind_json,
                field.has_error,
                field.is_primary,
                position as i64,
            ])?;
        Ok(())
    }

    fn delete_field(&mut self, field_id: &FieldId) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM cf_fields WHERE id = ?1", params![field_id.as_str()])?;
        Ok(())
    }

    fn load_schema(&self) -> Result<Schema, StorageError> {
        let tables: Vec<(String, String)> = self
            .conn
            .prepare_cached("SELECT id, name FROM cf_tables ORDER BY created_seq")?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut schema = Schema::new();
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, kind_json, has_error, is_primary FROM cf_fields \
             WHERE table_id = ?1 ORDER BY position",
        )?;
        for (id, name) in tables {
            let mut table = Table::new(name).with_id(TableId::parse(id)?);
            let rows: Vec<(String, String, String, bool, bool)> = stmt
                .query_map(params![table.id.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<Result<_, _>>()?;
            for (field_id, field_name, kind_json, has_error, is_primary) in rows {
                let kind: FieldKind = serde_json::from_str(&kind_json)?;
                table.fields.push(Field {
                    id: FieldId::parse(field_id)?,
                    name: field_name,
                    kind,
                    has_error,
                    is_primary,
                });
            }
            schema.insert_table(table);
        }
        Ok(schema)
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

struct RawTask {
    id: i64,
    table_id: String,
    record_id: String,
    field_ids_json: String,
    attempts: i64,
    status: String,
    claimed_by: Option<String>,
    last_error: Option<String>,
}

impl RawTask {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawTask {
            id: row.get(0)?,
            table_id: row.get(1)?,
            record_id: row.get(2)?,
            field_ids_json: row.get(3)?,
            attempts: row.get(4)?,
            status: row.get(5)?,
            claimed_by: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_task(self) -> Result<ComputedUpdateTask, StorageError> {
        Ok(ComputedUpdateTask {
            id: self.id,
            table_id: TableId::parse(self.table_id)?,
            record_id: RecordId::parse(self.record_id)?,
            field_ids: serde_json::from_str(&self.field_ids_json)?,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            status: self.status.parse()?,
            claimed_by: self.claimed_by,
            last_error: self.last_error,
        })
    }
}

const NOW: &str = "CAST(strftime('%s', 'now') AS INTEGER)";

impl OutboxStore for SqliteStore {
    fn enqueue(&mut self, table_id: &TableId, record_id: &RecordId, field_ids: &[FieldId]) -> Result<i64, StorageError> {
        let field_ids_json = serde_json::to_string(field_ids)?;
        self.conn
            .prepare_cached(&format!(
                "INSERT INTO cf_outbox (table_id, record_id, field_ids_json, status, created_at) \
                 VALUES (?1, ?2, ?3, 'pending', {NOW})"
            ))?
            .execute(params![table_id.as_str(), record_id.as_str(), field_ids_json])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn claim_batch(&mut self, worker_id: &str, limit: usize) -> Result<Vec<ComputedUpdateTask>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let raw = {
            let mut stmt = tx.prepare_cached(&format!(
                "UPDATE cf_outbox SET status = 'claimed', claimed_by = ?1, claimed_at = {NOW} \
                 WHERE id IN (SELECT id FROM cf_outbox WHERE status = 'pending' ORDER BY id LIMIT ?2) \
                 RETURNING id, table_id, record_id, field_ids_json, attempts, status, claimed_by, last_error"
            ))?;
            let rows = stmt
                .query_map(params![worker_id, limit as i64], RawTask::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        tx.commit()?;

        let mut tasks = raw
            .into_iter()
            .map(RawTask::into_task)
            .collect::<Result<Vec<_>, _>>()?;
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    fn complete(&mut self, task_id: i64) -> Result<(), StorageError> {
        let changed = self
            .conn
            .execute("DELETE FROM cf_outbox WHERE id = ?1", params![task_id])?;
        if changed == 0 {
            return Err(StorageError::TaskNotFound(task_id));
        }
        Ok(())
    }

    fn fail(&mut self, task_id: i64, error: &str, max_attempts: u32) -> Result<TaskStatus, StorageError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "UPDATE cf_outbox SET attempts = attempts + 1, last_error = ?2, \
                 status = CASE WHEN attempts + 1 >= ?3 THEN 'failed' ELSE 'pending' END, \
                 claimed_by = NULL, claimed_at = NULL \
                 WHERE id = ?1 RETURNING status",
                params![task_id, error, i64::from(max_attempts)],
                |row| row.get(0),
            )
            .optional()?;
        status
            .ok_or(StorageError::TaskNotFound(task_id))?
            .parse()
    }

    fn release(&mut self, task_id: i64) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE cf_outbox SET status = 'pending', claimed_by = NULL, claimed_at = NULL \
             WHERE id = ?1 AND status = 'claimed'",
            params![task_id],
        )?;
        if changed == 0 {
            return Err(StorageError::TaskNotFound(task_id));
        }
        Ok(())
    }

    fn pending_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cf_outbox WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn reclaim_stale(&mut self, older_than: Duration) -> Result<usize, StorageError> {
        let secs = i64::try_from(older_than.as_secs()).unwrap_or(i64::MAX);
        let reclaimed = self.conn.execute(
            &format!(
                "UPDATE cf_outbox SET status = 'pending', claimed_by = NULL, claimed_at = NULL \
                 WHERE status = 'claimed' AND claimed_at <= {NOW} - ?1"
            ),
            params![secs],
        )?;
        if reclaimed > 0 {
            warn!(reclaimed, "returned stale outbox claims to the queue");
        }
        Ok(reclaimed)
    }
}
