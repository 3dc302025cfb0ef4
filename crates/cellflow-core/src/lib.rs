//! Core model of the cellflow computed-field engine.
//!
//! # Modules
//!
//! - [`id`]: validated table/field/record identifiers
//! - [`value`]: cell values and persisted value shapes
//! - [`link`], [`lookup`], [`condition`]: per-variant configuration objects
//! - [`field`], [`visitor`]: the closed field model and its visitor
//! - [`schema`]: tables, the schema and boundary validation
//! - [`shape`]: value-shape inference
//! - [`formula`]: the formula black box
//! - [`graph`]: the dependency graph builder

pub mod condition;
pub mod error;
pub mod field;
pub mod formula;
pub mod graph;
pub mod id;
pub mod link;
pub mod lookup;
pub mod schema;
pub mod shape;
pub mod value;
pub mod visitor;

// Re-export commonly used types
pub use condition::{FieldCondition, FilterOperator, FilterValue};
pub use error::CoreError;
pub use field::{Field, FieldKind, FormulaOptions};
pub use formula::{BuiltinEvaluator, EvalError, Formula, FormulaError, FormulaEvaluator};
pub use graph::{DependencyGraph, EdgeKind, Reference};
pub use id::{FieldId, RecordId, TableId};
pub use link::{LinkDbConfig, LinkFieldConfig, Relationship};
pub use lookup::{
    ConditionalLookupOptions, ConditionalRollupConfig, LookupOptions, RollupFieldConfig,
    RollupFunction,
};
pub use schema::{Schema, Table};
pub use value::{CellValue, CellValueType, ValueShape};
pub use visitor::FieldVisitor;
