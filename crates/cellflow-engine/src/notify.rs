//! Change records and their delivery.
//!
//! Propagation collects every actually-changed computed value into a
//! [`ChangeSet`]. After commit, the set is handed to a [`ChangeNotifier`]
//! one table at a time.

use std::sync::Mutex;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cellflow_core::{CellValue, FieldId, RecordId, TableId};

/// The new value of one field on one record.
///
/// `old_value` is never filled by propagation: consumers re-read whatever
/// prior state they need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    pub new_value: CellValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<CellValue>,
}

/// Changed fields per record of one table.
pub type TableChanges = IndexMap<RecordId, IndexMap<FieldId, FieldChange>>;

/// Every change produced by one propagation, grouped by table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    tables: IndexMap<TableId, TableChanges>,
    /// Values recomputed to what was already stored. Not notified.
    #[serde(default)]
    republished: usize,
}

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    /// Records a change; a later change of the same cell replaces it.
    pub fn record(&mut self, table: &TableId, record: &RecordId, field: &FieldId, new_value: CellValue) {
        self.tables
            .entry(table.clone())
            .or_default()
            .entry(record.clone())
            .or_default()
            .insert(
                field.clone(),
                FieldChange {
                    new_value,
                    old_value: None,
                },
            );
    }

    pub(crate) fn count_republished(&mut self, n: usize) {
        self.republished += n;
    }

    pub fn republished(&self) -> usize {
        self.republished
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Number of changed cells.
    pub fn len(&self) -> usize {
        self.tables
            .values()
            .flat_map(|records| records.values())
            .map(IndexMap::len)
            .sum()
    }

    pub fn get(&self, table: &TableId, record: &RecordId, field: &FieldId) -> Option<&FieldChange> {
        self.tables.get(table)?.get(record)?.get(field)
    }

    pub fn table(&self, table: &TableId) -> Option<&TableChanges> {
        self.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&TableId, &TableChanges)> {
        self.tables.iter()
    }

    /// Every change to `field`, across records.
    pub fn changes_of<'a>(&'a self, field: &'a FieldId) -> impl Iterator<Item = (&'a RecordId, &'a FieldChange)> + 'a {
        self.tables
            .values()
            .flat_map(|records| records.iter())
            .filter_map(move |(record, fields)| fields.get(field).map(|c| (record, c)))
    }

    /// Folds `other` into this set; changes in `other` win.
    pub fn merge(&mut self, other: ChangeSet) {
        for (table, records) in other.tables {
            let into = self.tables.entry(table).or_default();
            for (record, fields) in records {
                into.entry(record).or_default().extend(fields);
            }
        }
        self.republished += other.republished;
    }
}

/// Receives committed changes.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, table: &TableId, changes: &TableChanges);
}

/// Hands every table of `changes` to `notifier`.
pub fn publish(notifier: &dyn ChangeNotifier, changes: &ChangeSet) {
    for (table, records) in changes.tables() {
        notifier.notify(table, records);
    }
}

/// Logs change batches through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ChangeNotifier for TracingNotifier {
    fn notify(&self, table: &TableId, changes: &TableChanges) {
        info!(table = %table, records = changes.len(), "computed values changed");
        for (record, fields) in changes {
            for (field, change) in fields {
                debug!(table = %table, record = %record, field = %field, value = ?change.new_value, "value changed");
            }
        }
    }
}

/// Keeps every batch in memory, in delivery order.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    batches: Mutex<Vec<(TableId, TableChanges)>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        CollectingNotifier::default()
    }

    /// Batches received so far.
    pub fn batches(&self) -> Vec<(TableId, TableChanges)> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Removes and returns the batches received so far.
    pub fn take(&self) -> Vec<(TableId, TableChanges)> {
        std::mem::take(&mut *self.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl ChangeNotifier for CollectingNotifier {
    fn notify(&self, table: &TableId, changes: &TableChanges) {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((table.clone(), changes.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(c: char) -> TableId {
        TableId::parse(format!("tbl{}", c.to_string().repeat(16))).unwrap()
    }

    fn fid(c: char) -> FieldId {
        FieldId::parse(format!("fld{}", c.to_string().repeat(16))).unwrap()
    }

    fn rid(c: char) -> RecordId {
        RecordId::parse(format!("rec{}", c.to_string().repeat(16))).unwrap()
    }

    #[test]
    fn later_changes_replace_earlier_ones() {
        let mut changes = ChangeSet::new();
        changes.record(&tid('A'), &rid('A'), &fid('A'), 1.0.into());
        changes.record(&tid('A'), &rid('A'), &fid('A'), 2.0.into());
        changes.record(&tid('A'), &rid('B'), &fid('A'), 3.0.into());
        assert_eq!(changes.len(), 2);
        let change = changes.get(&tid('A'), &rid('A'), &fid('A')).unwrap();
        assert_eq!(change.new_value, CellValue::Number(2.0));
        assert!(change.old_value.is_none());
    }

    #[test]
    fn publish_delivers_one_batch_per_table() {
        let mut changes = ChangeSet::new();
        changes.record(&tid('A'), &rid('A'), &fid('A'), 1.0.into());
        changes.record(&tid('B'), &rid('B'), &fid('B'), CellValue::Null);
        let mut more = ChangeSet::new();
        more.record(&tid('A'), &rid('C'), &fid('A'), 5.0.into());
        changes.merge(more);

        let notifier = CollectingNotifier::new();
        publish(&notifier, &changes);
        let batches = notifier.take();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, tid('A'));
        assert_eq!(batches[0].1.len(), 2);
        assert!(notifier.batches().is_empty());
    }

    #[test]
    fn change_json_omits_the_absent_old_value() {
        let change = FieldChange {
            new_value: CellValue::Number(4.0),
            old_value: None,
        };
        assert_eq!(serde_json::to_string(&change).unwrap(), r#"{"newValue":4.0}"#);
    }
}
