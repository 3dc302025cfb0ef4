//! The engine façade: schema changes, record writes and link changes, each
//! followed by propagation.
//!
//! Every mutation runs inside one store savepoint together with the
//! propagation it triggers, so a failure leaves neither the write nor any
//! derived value behind. Change notifications go out after commit.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::{debug, info};
use uuid::Uuid;

use cellflow_core::{
    BuiltinEvaluator, CellValue, DependencyGraph, Field, FieldId, FieldKind, FormulaEvaluator,
    RecordId, Relationship, Schema, Table, TableId,
};
use cellflow_sql::{CteStrategy, SqliteDialect};
use cellflow_storage::{
    ComputedUpdateTask, OutboxStore, RecordRow, RecordStore, ReferenceStore, SchemaStore,
    SqliteStore,
};

use crate::config::{EngineConfig, PropagationMode};
use crate::error::EngineError;
use crate::link::{LinkSideEffect, LinkSymmetricManager};
use crate::notify::{publish, ChangeNotifier, ChangeSet, TracingNotifier};
use crate::outbox;
use crate::propagation::{CellWrite, Propagator, Trigger};

/// Name of the primary field every new table starts with.
pub const PRIMARY_FIELD_NAME: &str = "Name";

pub struct Engine {
    store: SqliteStore,
    schema: Schema,
    graph: DependencyGraph,
    config: EngineConfig,
    evaluator: Box<dyn FormulaEvaluator>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl Engine {
    /// Opens the database named by `config` and loads its schema.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let store = if config.db_path == ":memory:" {
            SqliteStore::in_memory()?
        } else {
            SqliteStore::new(&config.db_path)?
        };
        let schema = store.load_schema()?;
        let graph = DependencyGraph::build(&schema)?;
        info!(
            db = %config.db_path,
            tables = schema.tables().count(),
            mode = %config.propagation_mode,
            "engine opened"
        );
        Ok(Engine {
            store,
            schema,
            graph,
            config,
            evaluator: Box::new(BuiltinEvaluator),
            notifier: Arc::new(TracingNotifier),
        })
    }

    /// A private in-memory engine with default settings.
    pub fn in_memory() -> Result<Self, EngineError> {
        Self::open(EngineConfig::in_memory())
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn FormulaEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut SqliteStore {
        &mut self.store
    }

    /// Re-reads the schema, picking up changes made through other
    /// connections.
    pub fn reload_schema(&mut self) -> Result<(), EngineError> {
        let schema = self.store.load_schema()?;
        self.graph = DependencyGraph::build(&schema)?;
        self.schema = schema;
        Ok(())
    }

    fn table(&self, id: &TableId) -> Result<&Table, EngineError> {
        self.schema
            .table(id)
            .ok_or_else(|| EngineError::NotFound(format!("table {id}")))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn record_ids(&self, table_id: &TableId) -> Result<Vec<RecordId>, EngineError> {
        Ok(self.store.record_ids(self.table(table_id)?)?)
    }

    pub fn row(&self, table_id: &TableId, record_id: &RecordId) -> Result<RecordRow, EngineError> {
        Ok(self.store.get_row(&self.schema, self.table(table_id)?, record_id)?)
    }

    /// Persisted value of one cell.
    pub fn value(&self, table_id: &TableId, record_id: &RecordId, field_id: &FieldId) -> Result<CellValue, EngineError> {
        let table = self.table(table_id)?;
        let field = table
            .field(field_id)
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id} in table {table_id}")))?;
        Ok(self.store.get_value(&self.schema, table, record_id, field)?)
    }

    /// Records linked from `record_id` through the link `field_id`.
    pub fn linked_records(&self, field_id: &FieldId, record_id: &RecordId) -> Result<Vec<RecordId>, EngineError> {
        let db = self
            .schema
            .field(field_id)
            .and_then(Field::link_config)
            .and_then(|config| config.db_config())
            .ok_or_else(|| EngineError::NotFound(format!("link field {field_id}")))?;
        Ok(self.store.linked_record_ids(&db, record_id)?)
    }

    /// Evaluation order of the computed fields of `table_id`, built over the
    /// tables it reaches. Fails with the cycle if the graph has one.
    pub fn evaluation_order(&self, table_id: &TableId) -> Result<Vec<FieldId>, EngineError> {
        let graph = DependencyGraph::build_table(&self.schema, table_id)?;
        Ok(graph.evaluation_order(table_id))
    }

    // -----------------------------------------------------------------------
    // Schema changes
    // -----------------------------------------------------------------------

    /// Creates a table with a primary text field.
    pub fn create_table(&mut self, name: &str) -> Result<TableId, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Rejected("table name must not be empty".to_string()));
        }
        if self.schema.tables().any(|t| t.name == name) {
            return Err(EngineError::Rejected(format!("a table named '{name}' already exists")));
        }
        let mut table = Table::new(name);
        table.fields.push(Field::text(PRIMARY_FIELD_NAME).primary());

        self.store.atomically(|store| -> Result<(), EngineError> {
            store.create_table_storage(&table)?;
            store.save_table(&table)?;
            Ok(())
        })?;
        info!(table = %table.id, name, "created table");
        let id = table.id.clone();
        self.schema.insert_table(table);
        self.graph = DependencyGraph::build(&self.schema)?;
        Ok(id)
    }

    /// Adds `field` to `table_id` and computes it for every record.
    ///
    /// Links get their key storage, and two-way links their mirror field on
    /// the foreign table. A field that would close a dependency cycle is
    /// rejected and nothing is persisted.
    pub fn create_field(&mut self, table_id: &TableId, field: Field) -> Result<ChangeSet, EngineError> {
        self.table(table_id)?;
        if self.schema.field(&field.id).is_some() {
            return Err(EngineError::Rejected(format!("field {} already exists", field.id)));
        }
        self.schema.validate_field(table_id, &field)?;
        let (field, effects) = LinkSymmetricManager::new(&self.schema).prepare_create(table_id, field)?;
        let field_id = field.id.clone();

        let mut next = self.schema.clone();
        next.add_field(table_id, field)?;
        apply_to_schema(&mut next, &effects)?;
        let (graph, repaired) = rebuild(&mut next, &field_id)?;

        let mut triggers = vec![Trigger::FieldCreated {
            table_id: table_id.clone(),
            field_id: field_id.clone(),
        }];
        triggers.extend(repaired);
        info!(table = %table_id, field = %field_id, "creating field");
        self.commit_schema(next, graph, &effects, triggers)
    }

    /// Changes the kind of `field_id`, keeping its id, name and position.
    ///
    /// A link keeps its key storage (and links) when relationship, foreign
    /// table and direction are unchanged; otherwise the old storage and
    /// mirror are dropped and new ones created.
    pub fn convert_field(&mut self, field_id: &FieldId, kind: FieldKind) -> Result<ChangeSet, EngineError> {
        let table_id = self
            .schema
            .table_of_field(field_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id}")))?;
        let old = self
            .schema
            .field(field_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id}")))?;

        let mut candidate = old.clone();
        candidate.kind = kind;
        candidate.has_error = false;
        let keeps_storage = match (old.link_config(), candidate.link_config()) {
            (Some(before), Some(after)) => {
                before.relationship == after.relationship
                    && before.foreign_table_id == after.foreign_table_id
                    && before.is_one_way == after.is_one_way
            }
            _ => false,
        };
        if keeps_storage {
            if let (Some(before), Some(after)) = (old.link_config(), candidate.link_config()) {
                let mut config = before.clone();
                config.lookup_field_id = after.lookup_field_id.clone();
                candidate.kind = FieldKind::Link(config);
            }
        }
        self.schema.validate_field(&table_id, &candidate)?;

        let mut next = self.schema.clone();
        let mut effects = Vec::new();
        if old.link_config().is_some() && !keeps_storage {
            let dropped = LinkSymmetricManager::new(&self.schema).prepare_delete(&table_id, &old)?;
            apply_to_schema(&mut next, &dropped)?;
            effects.extend(dropped);
        }
        if candidate.link_config().is_some() && !keeps_storage {
            let (materialized, created) =
                LinkSymmetricManager::new(&next).prepare_create(&table_id, candidate)?;
            candidate = materialized;
            apply_to_schema(&mut next, &created)?;
            effects.extend(created);
        }
        next.replace_field(candidate)?;
        let (graph, repaired) = rebuild(&mut next, field_id)?;

        let mut triggers = vec![Trigger::FieldConverted {
            table_id: table_id.clone(),
            field_id: field_id.clone(),
        }];
        triggers.extend(repaired);
        info!(table = %table_id, field = %field_id, from = old.kind.type_name(), "converting field");
        self.commit_schema(next, graph, &effects, triggers)
    }

    /// Removes `field_id`. Computed fields reading it become broken and
    /// their values null. Deleting either side of a two-way link removes
    /// the other side as well.
    pub fn delete_field(&mut self, field_id: &FieldId) -> Result<ChangeSet, EngineError> {
        let table_id = self
            .schema
            .table_of_field(field_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id}")))?;
        let field = self
            .schema
            .field(field_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id}")))?;
        if field.is_primary {
            return Err(EngineError::Rejected(format!(
                "{field_id} is the primary field of {table_id} and cannot be deleted"
            )));
        }
        let effects = LinkSymmetricManager::new(&self.schema).prepare_delete(&table_id, &field)?;

        let mut next = self.schema.clone();
        next.remove_field(field_id);
        apply_to_schema(&mut next, &effects)?;
        let (graph, repaired) = rebuild(&mut next, field_id)?;
        info!(table = %table_id, field = %field_id, "deleting field");
        self.commit_schema(next, graph, &effects, repaired)
    }

    /// Removes a table with its records. Two-way links into it lose their
    /// mirrors on the other side; fields of other tables that still read
    /// from it become broken and their values null.
    pub fn delete_table(&mut self, table_id: &TableId) -> Result<ChangeSet, EngineError> {
        let table = self.table(table_id)?.clone();
        let manager = LinkSymmetricManager::new(&self.schema);
        let mut effects = Vec::new();
        for field in table.fields.iter().filter(|f| f.link_config().is_some()) {
            effects.extend(manager.prepare_delete(table_id, field)?);
        }

        let mut next = self.schema.clone();
        next.remove_table(table_id);
        apply_to_schema(&mut next, &effects)?;
        // Every reader of the table reads one of its fields, so a table
        // without fields cannot leave anything broken behind.
        let (graph, repaired) = match table.primary_field().or_else(|| table.fields.first()) {
            Some(cause) => rebuild(&mut next, &cause.id)?,
            None => (DependencyGraph::build(&next)?, Vec::new()),
        };
        info!(table = %table_id, "deleting table");
        self.commit_schema(next, graph, &effects, repaired)
    }

    /// Persists `next` and runs `triggers` against it, atomically.
    fn commit_schema(
        &mut self,
        next: Schema,
        graph: DependencyGraph,
        effects: &[LinkSideEffect],
        triggers: Vec<Trigger>,
    ) -> Result<ChangeSet, EngineError> {
        let before: HashSet<&FieldId> = self.schema.fields().map(|(_, f)| &f.id).collect();
        let after: HashSet<&FieldId> = next.fields().map(|(_, f)| &f.id).collect();
        let dropped_tables: Vec<(TableId, String)> = self
            .schema
            .tables()
            .filter(|t| next.table(&t.id).is_none())
            .map(|t| (t.id.clone(), t.db_table_name().to_string()))
            .collect();
        // Columns of dropped tables go with their table.
        let removed: Vec<(Option<String>, FieldId)> = self
            .schema
            .fields()
            .filter(|(_, f)| !after.contains(&f.id))
            .map(|(t, f)| {
                let physical = next.table(t).map(|table| table.db_table_name().to_string());
                (physical, f.id.clone())
            })
            .collect();
        let added: Vec<(String, FieldId)> = next
            .fields()
            .filter(|(_, f)| !before.contains(&f.id))
            .filter_map(|(t, f)| {
                let physical = next.table(t)?.db_table_name().to_string();
                Some((physical, f.id.clone()))
            })
            .collect();

        let strategy = self.config.cte_strategy;
        let Engine {
            store, evaluator, ..
        } = self;
        let changes = store.atomically(|store| -> Result<ChangeSet, EngineError> {
            for effect in effects {
                apply_to_storage(store, effect)?;
            }
            for (physical, field_id) in &removed {
                if let Some(physical) = physical {
                    store.drop_column(physical, field_id.as_str())?;
                }
                store.delete_references_of(field_id)?;
            }
            for (dropped, physical) in &dropped_tables {
                store.drop_table_storage(physical)?;
                store.delete_table(dropped)?;
            }
            for (physical, field_id) in &added {
                store.add_column(physical, field_id.as_str())?;
            }
            for table in next.tables() {
                store.save_table(table)?;
            }
            for (_, field) in next.fields() {
                store.replace_references(&field.id, &graph.dependencies(&field.id))?;
            }
            propagate(store, &next, &graph, &**evaluator, strategy, &triggers)
        })?;

        self.schema = next;
        self.graph = graph;
        publish(self.notifier.as_ref(), &changes);
        Ok(changes)
    }

    // -----------------------------------------------------------------------
    // Record writes
    // -----------------------------------------------------------------------

    /// Inserts a record with the given primitive values and computes its
    /// computed fields.
    pub fn create_record(
        &mut self,
        table_id: &TableId,
        values: Vec<(FieldId, CellValue)>,
    ) -> Result<(RecordId, ChangeSet), EngineError> {
        let table = self.table(table_id)?.clone();
        check_writes(&table, &values)?;
        let record_id = RecordId::generate();

        let changes = self.write_then_propagate(|store| {
            store.insert_record(&table, &record_id)?;
            write_values(store, &table, &record_id, &values)?;
            // Every field counts as written, so the new record's computed
            // fields and the conditions reading this table are evaluated.
            let writes = table
                .fields
                .iter()
                .map(|f| CellWrite {
                    table_id: table.id.clone(),
                    record_id: record_id.clone(),
                    field_id: f.id.clone(),
                })
                .collect();
            Ok(vec![Trigger::RecordWrites(writes)])
        })?;
        debug!(table = %table_id, record = %record_id, "created record");
        Ok((record_id, changes))
    }

    /// Writes primitive values of one record.
    pub fn update_record(
        &mut self,
        table_id: &TableId,
        record_id: &RecordId,
        values: Vec<(FieldId, CellValue)>,
    ) -> Result<ChangeSet, EngineError> {
        let table = self.table(table_id)?.clone();
        check_writes(&table, &values)?;
        if values.is_empty() {
            return Ok(ChangeSet::new());
        }
        self.write_then_propagate(|store| {
            write_values(store, &table, record_id, &values)?;
            let writes = values
                .iter()
                .map(|(field_id, _)| CellWrite {
                    table_id: table.id.clone(),
                    record_id: record_id.clone(),
                    field_id: field_id.clone(),
                })
                .collect();
            Ok(vec![Trigger::RecordWrites(writes)])
        })
    }

    /// Replaces the records linked from `record_id` through `field_id`.
    ///
    /// When a foreign record can have only one host (one-to-one and
    /// one-to-many), linking it detaches it from its previous host.
    pub fn set_link(
        &mut self,
        table_id: &TableId,
        record_id: &RecordId,
        field_id: &FieldId,
        foreign_ids: Vec<RecordId>,
    ) -> Result<ChangeSet, EngineError> {
        let table = self.table(table_id)?;
        let field = table
            .field(field_id)
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id} in table {table_id}")))?;
        let config = field
            .link_config()
            .ok_or_else(|| EngineError::Rejected(format!("{field_id} is not a link field")))?
            .clone();
        let db = config
            .db_config()
            .ok_or_else(|| EngineError::Rejected(format!("link {field_id} has no key storage")))?;
        let ids: Vec<RecordId> = foreign_ids
            .into_iter()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        if !config.is_multiple() && ids.len() > 1 {
            return Err(EngineError::Rejected(format!(
                "link {field_id} holds at most one record, got {}",
                ids.len()
            )));
        }
        if !self.store.record_ids(table)?.contains(record_id) {
            return Err(EngineError::NotFound(format!("record {record_id} in table {table_id}")));
        }
        let foreign = self.table(&config.foreign_table_id)?;
        let existing: HashSet<RecordId> = self.store.record_ids(foreign)?.into_iter().collect();
        if let Some(missing) = ids.iter().find(|id| !existing.contains(*id)) {
            return Err(EngineError::NotFound(format!("record {missing} in table {}", foreign.id)));
        }

        let exclusive = matches!(config.relationship, Relationship::OneOne | Relationship::OneMany);
        let symmetric = config
            .symmetric_field_id()
            .map(|s| (config.foreign_table_id.clone(), s.clone()));
        self.write_then_propagate(|store| {
            let previous = store.linked_record_ids(&db, record_id)?;
            let mut hosts: IndexSet<RecordId> = IndexSet::from([record_id.clone()]);
            if exclusive && !ids.is_empty() {
                for other in store.hosts_linking_to(&db, &ids)? {
                    if &other == record_id {
                        continue;
                    }
                    let kept: Vec<RecordId> = store
                        .linked_record_ids(&db, &other)?
                        .into_iter()
                        .filter(|id| !ids.contains(id))
                        .collect();
                    store.set_links(&db, &other, &kept)?;
                    hosts.insert(other);
                }
            }
            store.set_links(&db, record_id, &ids)?;

            let foreign_records: IndexSet<RecordId> =
                previous.into_iter().chain(ids.iter().cloned()).collect();
            Ok(vec![Trigger::LinkChanged {
                table_id: table_id.clone(),
                field_id: field_id.clone(),
                hosts: hosts.into_iter().collect(),
                symmetric,
                foreign_records: foreign_records.into_iter().collect(),
            }])
        })
    }

    /// Runs `write` and then, depending on the propagation mode, either
    /// propagates its triggers or queues them, in one savepoint.
    fn write_then_propagate(
        &mut self,
        write: impl FnOnce(&mut SqliteStore) -> Result<Vec<Trigger>, EngineError>,
    ) -> Result<ChangeSet, EngineError> {
        let mode = self.config.propagation_mode;
        let strategy = self.config.cte_strategy;
        let Engine {
            store,
            schema,
            graph,
            evaluator,
            ..
        } = self;
        let changes = store.atomically(|store| -> Result<ChangeSet, EngineError> {
            let triggers = write(store)?;
            match mode {
                PropagationMode::Sync => {
                    propagate(store, schema, graph, &**evaluator, strategy, &triggers)
                }
                PropagationMode::Outbox => {
                    for trigger in &triggers {
                        for (table_id, record_id, field_ids) in trigger.outbox_tasks() {
                            let task = store.enqueue(&table_id, &record_id, &field_ids)?;
                            debug!(task, table = %table_id, record = %record_id, "queued recomputation");
                        }
                    }
                    Ok(ChangeSet::new())
                }
            }
        })?;
        publish(self.notifier.as_ref(), &changes);
        Ok(changes)
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    /// Propagates one outbox task synchronously.
    pub fn propagate_task(&mut self, task: &ComputedUpdateTask) -> Result<ChangeSet, EngineError> {
        self.table(&task.table_id)?;
        let writes = task
            .field_ids
            .iter()
            .map(|field_id| CellWrite {
                table_id: task.table_id.clone(),
                record_id: task.record_id.clone(),
                field_id: field_id.clone(),
            })
            .collect();
        let triggers = [Trigger::RecordWrites(writes)];

        let strategy = self.config.cte_strategy;
        let Engine {
            store,
            schema,
            graph,
            evaluator,
            ..
        } = self;
        let changes = store.atomically(|store| {
            propagate(store, schema, graph, &**evaluator, strategy, &triggers)
        })?;
        publish(self.notifier.as_ref(), &changes);
        Ok(changes)
    }

    /// Processes queued recomputations until the queue is empty. Returns
    /// the number of tasks handled.
    pub fn drain_outbox(&mut self) -> Result<usize, EngineError> {
        let worker_id = format!("drain-{}", Uuid::new_v4());
        let batch = self.config.outbox_batch_size;
        let mut total = 0;
        loop {
            let handled = outbox::process_batch(self, &worker_id, batch, None)?;
            if handled == 0 {
                break;
            }
            total += handled;
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn propagate(
    store: &mut SqliteStore,
    schema: &Schema,
    graph: &DependencyGraph,
    evaluator: &dyn FormulaEvaluator,
    strategy: CteStrategy,
    triggers: &[Trigger],
) -> Result<ChangeSet, EngineError> {
    Propagator::new(schema, graph, store, evaluator, &SqliteDialect)
        .with_strategy(strategy)
        .run(triggers)
}

/// Only primitive fields of `table` can be written directly.
fn check_writes(table: &Table, values: &[(FieldId, CellValue)]) -> Result<(), EngineError> {
    for (field_id, _) in values {
        let field = table
            .field(field_id)
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id} in table {}", table.id)))?;
        if field.is_computed() {
            return Err(EngineError::Rejected(format!(
                "{} is a {} field and cannot be written directly",
                field_id,
                field.kind.type_name()
            )));
        }
    }
    Ok(())
}

fn write_values(
    store: &mut SqliteStore,
    table: &Table,
    record_id: &RecordId,
    values: &[(FieldId, CellValue)],
) -> Result<(), EngineError> {
    for (field_id, value) in values {
        let field = table
            .field(field_id)
            .ok_or_else(|| EngineError::NotFound(format!("field {field_id}")))?;
        store.set_column(table, record_id, field, value)?;
    }
    Ok(())
}

/// Applies the schema part of link side effects.
fn apply_to_schema(schema: &mut Schema, effects: &[LinkSideEffect]) -> Result<(), EngineError> {
    for effect in effects {
        match effect {
            LinkSideEffect::CreateField { table_id, field } => {
                schema.add_field(table_id, field.clone())?;
            }
            LinkSideEffect::DeleteField { field_id } => {
                schema.remove_field(field_id);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Applies the key-storage part of a link side effect. Field columns are
/// handled with every other added or removed field.
fn apply_to_storage(store: &mut SqliteStore, effect: &LinkSideEffect) -> Result<(), EngineError> {
    match effect {
        LinkSideEffect::CreateJunction {
            name,
            self_key,
            foreign_key,
        } => store.create_junction(name, self_key, foreign_key)?,
        LinkSideEffect::DropJunction { name } => store.drop_junction(name)?,
        LinkSideEffect::AddForeignKeyColumn { table, column } => store.add_column(table, column)?,
        LinkSideEffect::DropForeignKeyColumn { table, column } => store.drop_column(table, column)?,
        LinkSideEffect::CreateField { .. } | LinkSideEffect::DeleteField { .. } => {}
    }
    Ok(())
}

/// Builds the graph of `schema` and brings every `has_error` flag in line
/// with it. Returns the graph and triggers for the fields whose flag
/// flipped, blaming newly broken ones on `cause`.
fn rebuild(schema: &mut Schema, cause: &FieldId) -> Result<(DependencyGraph, Vec<Trigger>), EngineError> {
    let graph = DependencyGraph::build(schema)?;
    let mut broken = Vec::new();
    let mut healed = Vec::new();
    let ids: Vec<(TableId, FieldId)> = schema
        .fields()
        .map(|(t, f)| (t.clone(), f.id.clone()))
        .collect();
    for (table_id, field_id) in ids {
        let is_broken = graph.is_broken(&field_id);
        let Some(field) = schema.field_mut(&field_id) else {
            continue;
        };
        if is_broken && !field.has_error {
            broken.push(field_id);
        } else if !is_broken && field.has_error {
            healed.push(Trigger::FieldConverted { table_id, field_id });
        }
        field.has_error = is_broken;
    }
    for broken_field in graph.broken_fields() {
        debug!(field = %broken_field.field_id, reason = %broken_field.reason, "field is broken");
    }

    let mut triggers = Vec::new();
    if !broken.is_empty() {
        triggers.push(Trigger::FieldDeleted {
            field_id: cause.clone(),
            broken,
        });
    }
    triggers.extend(healed);
    Ok((graph, triggers))
}
