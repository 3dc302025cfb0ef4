//! Cell values and the persisted shape of a field's values.
//!
//! [`CellValue`] is the single value representation flowing between the
//! storage layer, the formula evaluator and the propagation diff. Its JSON
//! form is untagged, so a list of linked records round-trips as
//! `[{"id": "rec...", "title": "..."}]` and scalars as plain JSON scalars.

use serde::{Deserialize, Serialize};

use crate::id::RecordId;

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// A reference to a linked record with its display title.
    Link {
        id: RecordId,
        #[serde(default)]
        title: Option<String>,
    },
    List(Vec<CellValue>),
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        CellValue::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// `true` for null, empty text and empty lists.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Null => true,
            CellValue::Text(s) => s.is_empty(),
            CellValue::List(items) => items.iter().all(CellValue::is_empty),
            _ => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            CellValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            CellValue::List(items) if items.len() == 1 => items[0].as_number(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            CellValue::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    /// Truthiness used by formula conditionals.
    pub fn is_truthy(&self) -> bool {
        match self {
            CellValue::Null => false,
            CellValue::Bool(b) => *b,
            CellValue::Number(n) => *n != 0.0,
            CellValue::Text(s) => !s.is_empty(),
            CellValue::Link { .. } => true,
            CellValue::List(items) => items.iter().any(CellValue::is_truthy),
        }
    }

    /// Human-readable rendering used for concatenation and link titles.
    pub fn display_string(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Text(s) => s.clone(),
            CellValue::Link { id, title } => title.clone().unwrap_or_else(|| id.to_string()),
            CellValue::List(items) => items
                .iter()
                .filter(|v| !v.is_null())
                .map(CellValue::display_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Record ids held by a link value (single link or list of links).
    pub fn link_ids(&self) -> Vec<RecordId> {
        match self {
            CellValue::Link { id, .. } => vec![id.clone()],
            CellValue::List(items) => items.iter().flat_map(CellValue::link_ids).collect(),
            _ => Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Converts a JSON value, collapsing anything unrepresentable to null.
    pub fn from_json(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or(CellValue::Null)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

/// Integral numbers print without a trailing `.0`.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Scalar type of a field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CellValueType {
    String,
    Number,
    Boolean,
    DateTime,
}

/// The persisted shape of a field: scalar type plus whether each cell holds
/// a list of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueShape {
    pub cell_type: CellValueType,
    pub is_multiple: bool,
}

impl ValueShape {
    pub const fn scalar(cell_type: CellValueType) -> Self {
        ValueShape {
            cell_type,
            is_multiple: false,
        }
    }

    pub const fn multiple(cell_type: CellValueType) -> Self {
        ValueShape {
            cell_type,
            is_multiple: true,
        }
    }

    /// `true` when values are stored as JSON text rather than a native column.
    pub fn is_json(&self) -> bool {
        self.is_multiple
    }
}
