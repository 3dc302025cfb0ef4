//! Core error types for cellflow-core.
//!
//! Uses `thiserror` for structured, matchable error variants. The taxonomy
//! separates errors surfaced to the caller (validation, invariant violation,
//! dependency cycle) from conditions that are recovered locally (dangling
//! references and evaluation errors never appear here; they degrade a single
//! field instead).

use thiserror::Error;

use crate::formula::FormulaError;
use crate::id::{FieldId, TableId};

/// Core errors produced by the cellflow-core crate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// An identifier failed format validation.
    #[error("invalid {kind} id '{value}': {reason}")]
    InvalidId {
        kind: &'static str,
        value: String,
        reason: String,
    },

    /// A field or table configuration is malformed.
    #[error("validation failed for field {field}: {reason}")]
    Validation { field: String, reason: String },

    /// An already-fixed value was re-set to a conflicting value.
    #[error("invariant violation on field {field}: {reason}")]
    InvariantViolation { field: FieldId, reason: String },

    /// The field configurations contain a dependency cycle.
    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    DependencyCycle { cycle: Vec<FieldId> },

    /// A field id was not found in the schema.
    #[error("field not found: {id}")]
    UnknownField { id: FieldId },

    /// A table id was not found in the schema.
    #[error("table not found: {id}")]
    UnknownTable { id: TableId },

    /// A formula expression failed to parse.
    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),
}

impl CoreError {
    /// Shorthand for a [`CoreError::Validation`] error.
    pub fn validation(field: impl ToString, reason: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Fields named by this error, if any. Used to build descriptive
    /// rejections naming the conflicting field(s).
    pub fn fields(&self) -> Vec<FieldId> {
        match self {
            CoreError::InvariantViolation { field, .. } => vec![field.clone()],
            CoreError::DependencyCycle { cycle } => cycle.clone(),
            CoreError::UnknownField { id } => vec![id.clone()],
            _ => Vec::new(),
        }
    }
}

fn format_cycle(cycle: &[FieldId]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(FieldId::as_str).collect();
    if let Some(first) = cycle.first() {
        parts.push(first.as_str());
    }
    parts.join(" -> ")
}
