//! Storage-layer types shared by the store traits.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use cellflow_core::{CellValue, FieldId, RecordId, TableId};

use crate::error::StorageError;

/// One record's values keyed by field id, in field order.
pub type RecordRow = IndexMap<FieldId, CellValue>;

/// Lifecycle of an outbox task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "claimed" => Ok(TaskStatus::Claimed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(StorageError::IntegrityError {
                reason: format!("unknown outbox status '{other}'"),
            }),
        }
    }
}

/// A deferred recomputation: `field_ids` changed on `record_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedUpdateTask {
    pub id: i64,
    pub table_id: TableId,
    pub record_id: RecordId,
    /// Trigger fields whose new values are already persisted.
    pub field_ids: Vec<FieldId>,
    pub attempts: u32,
    pub status: TaskStatus,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
}
