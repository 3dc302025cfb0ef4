//! The propagation orchestrator.
//!
//! A propagation walks the phases
//! `Triggered -> Expanded -> Ordered -> Recomputed -> Diffed -> Committed`:
//!
//! 1. triggers become seeds: trigger fields and the records they changed on;
//! 2. the dependency graph expands the trigger fields to every transitive
//!    dependent;
//! 3. the dependents are ordered topologically, batched per table;
//! 4. each field is recomputed for the records reached from its changed
//!    dependencies (formulas in memory, everything else through SQL);
//! 5. fresh values are compared with persisted ones;
//! 6. changed values are written and collected into a [`ChangeSet`].
//!
//! Only records whose value actually changed feed the next field, so an
//! unchanged intermediate result stops the walk early.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, debug_span, warn};

use cellflow_core::graph::EdgeKind;
use cellflow_core::{
    CellValue, DependencyGraph, Field, FieldId, FieldKind, FormulaEvaluator, RecordId, Schema,
    Table, TableId,
};
use cellflow_sql::{CteStrategy, DialectProvider, RecordQueryBuilder};
use cellflow_storage::{encode, ColumnCodec, RecordStore};

use crate::error::EngineError;
use crate::notify::ChangeSet;

/// A persisted write to one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellWrite {
    pub table_id: TableId,
    pub record_id: RecordId,
    pub field_id: FieldId,
}

/// What started a propagation. All writes are already persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    RecordWrites(Vec<CellWrite>),
    /// A field was added; it is computed for every record.
    FieldCreated { table_id: TableId, field_id: FieldId },
    /// A field changed kind; it and its dependents are recomputed.
    FieldConverted { table_id: TableId, field_id: FieldId },
    /// A field was removed and `broken` fields lost a dependency.
    FieldDeleted { field_id: FieldId, broken: Vec<FieldId> },
    /// The links of `field_id` changed on `hosts`. The mirror, if any, is
    /// refreshed on `foreign_records` (previously and newly linked).
    LinkChanged {
        table_id: TableId,
        field_id: FieldId,
        hosts: Vec<RecordId>,
        symmetric: Option<(TableId, FieldId)>,
        foreign_records: Vec<RecordId>,
    },
}

impl Trigger {
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::RecordWrites(_) => "record_writes",
            Trigger::FieldCreated { .. } => "field_created",
            Trigger::FieldConverted { .. } => "field_converted",
            Trigger::FieldDeleted { .. } => "field_deleted",
            Trigger::LinkChanged { .. } => "link_changed",
        }
    }

    /// Deferred form of a record-level trigger: one `(table, record,
    /// fields)` entry per record whose cells changed. Schema triggers have
    /// none.
    pub fn outbox_tasks(&self) -> Vec<(TableId, RecordId, Vec<FieldId>)> {
        let mut tasks: IndexMap<(TableId, RecordId), Vec<FieldId>> = IndexMap::new();
        match self {
            Trigger::RecordWrites(writes) => {
                for write in writes {
                    let fields = tasks
                        .entry((write.table_id.clone(), write.record_id.clone()))
                        .or_default();
                    if !fields.contains(&write.field_id) {
                        fields.push(write.field_id.clone());
                    }
                }
            }
            Trigger::LinkChanged {
                table_id,
                field_id,
                hosts,
                symmetric,
                foreign_records,
            } => {
                for host in hosts {
                    tasks.insert((table_id.clone(), host.clone()), vec![field_id.clone()]);
                }
                if let Some((foreign_table, symmetric_id)) = symmetric {
                    for record in foreign_records {
                        tasks.insert((foreign_table.clone(), record.clone()), vec![symmetric_id.clone()]);
                    }
                }
            }
            Trigger::FieldCreated { .. } | Trigger::FieldConverted { .. } | Trigger::FieldDeleted { .. } => {}
        }
        tasks
            .into_iter()
            .map(|((table, record), fields)| (table, record, fields))
            .collect()
    }
}

/// Trigger fields and the records they changed on.
type Touched = HashMap<FieldId, IndexSet<RecordId>>;

pub struct Propagator<'a, S: RecordStore> {
    schema: &'a Schema,
    graph: &'a DependencyGraph,
    store: &'a mut S,
    evaluator: &'a dyn FormulaEvaluator,
    dialect: &'a dyn DialectProvider,
    strategy: CteStrategy,
}

impl<'a, S: RecordStore> Propagator<'a, S> {
    pub fn new(
        schema: &'a Schema,
        graph: &'a DependencyGraph,
        store: &'a mut S,
        evaluator: &'a dyn FormulaEvaluator,
        dialect: &'a dyn DialectProvider,
    ) -> Self {
        Propagator {
            schema,
            graph,
            store,
            evaluator,
            dialect,
            strategy: CteStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: CteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Brings every value depending on `triggers` up to date.
    pub fn run(&mut self, triggers: &[Trigger]) -> Result<ChangeSet, EngineError> {
        let kinds: Vec<&str> = triggers.iter().map(Trigger::kind).collect();
        let span = debug_span!("propagate", triggers = ?kinds);
        let _entered = span.enter();

        let mut touched = Touched::new();
        for trigger in triggers {
            self.seed(trigger, &mut touched)?;
        }
        let trigger_fields: Vec<FieldId> = touched.keys().cloned().collect();
        debug!(phase = "triggered", fields = trigger_fields.len());

        let closure = self.graph.affected_closure(&trigger_fields);
        debug!(phase = "expanded", fields = closure.len());

        let batches = self.graph.order_by_table(&closure);
        debug!(phase = "ordered", batches = batches.len());

        let mut changes = ChangeSet::new();
        for (table_id, fields) in batches {
            let table = self
                .schema
                .table(&table_id)
                .ok_or_else(|| EngineError::NotFound(format!("table {table_id}")))?;
            for field_id in fields {
                let Some(field) = table.field(&field_id) else {
                    continue;
                };
                let records = self.affected_records(table, &field_id, &touched)?;
                if records.is_empty() {
                    touched.insert(field_id, IndexSet::new());
                    continue;
                }
                let fresh = self.recompute(table, field, &records)?;
                debug!(phase = "recomputed", field = %field_id, records = fresh.len());
                let changed = self.commit_changed(table, field, fresh, &mut changes)?;
                debug!(phase = "committed", field = %field_id, changed = changed.len());
                touched.insert(field_id, changed);
            }
        }
        Ok(changes)
    }

    // -----------------------------------------------------------------------
    // Triggered
    // -----------------------------------------------------------------------

    fn seed(&self, trigger: &Trigger, touched: &mut Touched) -> Result<(), EngineError> {
        match trigger {
            Trigger::RecordWrites(writes) => {
                for write in writes {
                    touched
                        .entry(write.field_id.clone())
                        .or_default()
                        .insert(write.record_id.clone());
                }
            }
            Trigger::FieldCreated { table_id, field_id }
            | Trigger::FieldConverted { table_id, field_id } => {
                let all = self.all_records(table_id)?;
                touched.entry(field_id.clone()).or_default().extend(all);
            }
            Trigger::FieldDeleted { broken, .. } => {
                for field_id in broken {
                    let Some(table_id) = self.schema.table_of_field(field_id) else {
                        continue;
                    };
                    let all = self.all_records(table_id)?;
                    touched.entry(field_id.clone()).or_default().extend(all);
                }
            }
            Trigger::LinkChanged {
                field_id,
                hosts,
                symmetric,
                foreign_records,
                ..
            } => {
                touched
                    .entry(field_id.clone())
                    .or_default()
                    .extend(hosts.iter().cloned());
                if let Some((_, symmetric_id)) = symmetric {
                    touched
                        .entry(symmetric_id.clone())
                        .or_default()
                        .extend(foreign_records.iter().cloned());
                }
            }
        }
        Ok(())
    }

    fn all_records(&self, table_id: &TableId) -> Result<Vec<RecordId>, EngineError> {
        let table = self
            .schema
            .table(table_id)
            .ok_or_else(|| EngineError::NotFound(format!("table {table_id}")))?;
        Ok(self.store.record_ids(table)?)
    }

    // -----------------------------------------------------------------------
    // Expanded (records)
    // -----------------------------------------------------------------------

    /// Records of `table` whose `field` may have changed: its own seeds plus
    /// records reached from the changed records of each dependency.
    fn affected_records(
        &self,
        table: &Table,
        field_id: &FieldId,
        touched: &Touched,
    ) -> Result<IndexSet<RecordId>, EngineError> {
        let mut records = touched.get(field_id).cloned().unwrap_or_default();
        for dependency in self.graph.incoming(field_id) {
            let Some(changed) = touched.get(&dependency.field).filter(|c| !c.is_empty()) else {
                continue;
            };
            match dependency.kind {
                EdgeKind::SameTable => records.extend(changed.iter().cloned()),
                EdgeKind::CrossTable { via_link } => {
                    let Some(db) = self
                        .schema
                        .field(&via_link)
                        .and_then(Field::link_config)
                        .and_then(|config| config.db_config())
                    else {
                        continue;
                    };
                    let foreign: Vec<RecordId> = changed.iter().cloned().collect();
                    records.extend(self.store.hosts_linking_to(&db, &foreign)?);
                }
                EdgeKind::Condition => {
                    records.extend(self.store.record_ids(table)?);
                    break;
                }
            }
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Recomputed
    // -----------------------------------------------------------------------

    fn recompute(
        &mut self,
        table: &Table,
        field: &Field,
        records: &IndexSet<RecordId>,
    ) -> Result<Vec<(RecordId, CellValue)>, EngineError> {
        if field.has_error || self.graph.is_broken(&field.id) {
            return Ok(records.iter().map(|r| (r.clone(), CellValue::Null)).collect());
        }
        match &field.kind {
            FieldKind::Formula(options) => {
                let mut out = Vec::with_capacity(records.len());
                for record in records {
                    let row = self.store.get_row(self.schema, table, record)?;
                    let values: HashMap<FieldId, CellValue> = row.into_iter().collect();
                    let value = match self.evaluator.evaluate(&options.expression, &values) {
                        Ok(value) => value,
                        Err(err) => {
                            debug!(field = %field.id, record = %record, error = %err, "formula evaluated to null");
                            CellValue::Null
                        }
                    };
                    out.push((record.clone(), value));
                }
                Ok(out)
            }
            _ => self.select_fresh(table, field, records),
        }
    }

    /// Reads `field` fresh through its compiled SQL selection.
    fn select_fresh(
        &mut self,
        table: &Table,
        field: &Field,
        records: &IndexSet<RecordId>,
    ) -> Result<Vec<(RecordId, CellValue)>, EngineError> {
        let ids: Vec<RecordId> = records.iter().cloned().collect();
        let nulls = || ids.iter().map(|r| (r.clone(), CellValue::Null)).collect();

        let query = RecordQueryBuilder::new(self.schema, self.dialect, table.id.clone())
            .with_strategy(self.strategy)
            .build(std::slice::from_ref(&field.id), Some(ids.as_slice()))?;
        if !query.failed.is_empty() {
            return Ok(nulls());
        }
        let codec = ColumnCodec::for_field(self.schema, field);
        match self.store.query_values(&query.sql, &query.params, &[codec]) {
            Ok(rows) => Ok(rows
                .into_iter()
                .map(|(record, mut values)| (record, values.pop().unwrap_or_default()))
                .collect()),
            Err(err) => {
                warn!(table = %table.id, field = %field.id, error = %err, "fresh selection failed, using null");
                Ok(nulls())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Diffed + Committed
    // -----------------------------------------------------------------------

    /// Persists the values that differ from storage and returns their
    /// records.
    fn commit_changed(
        &mut self,
        table: &Table,
        field: &Field,
        fresh: Vec<(RecordId, CellValue)>,
        changes: &mut ChangeSet,
    ) -> Result<IndexSet<RecordId>, EngineError> {
        let codec = ColumnCodec::for_field(self.schema, field);
        let mut changed = IndexSet::new();
        let mut unchanged = 0;
        for (record, value) in fresh {
            // Store-and-reload normal form, so equal values compare equal.
            let value = codec.decode(encode(&value)?)?;
            let old = self.store.get_value(self.schema, table, &record, field)?;
            if old == value {
                unchanged += 1;
                continue;
            }
            self.store.set_column(table, &record, field, &value)?;
            changes.record(&table.id, &record, &field.id, value);
            changed.insert(record);
        }
        changes.count_republished(unchanged);
        Ok(changed)
    }
}
