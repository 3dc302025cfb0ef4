//! Lookup, rollup and conditional-rollup configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::condition::FieldCondition;
use crate::error::CoreError;
use crate::id::{FieldId, TableId};
use crate::value::{CellValueType, ValueShape};

/// Reaches a foreign field through a local link field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupOptions {
    pub link_field_id: FieldId,
    pub foreign_table_id: TableId,
    pub lookup_field_id: FieldId,
}

/// Aggregates a foreign field over the records reached through a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupFieldConfig {
    #[serde(flatten)]
    pub options: LookupOptions,
    pub expression: RollupFunction,
}

/// Selects foreign rows by a filter instead of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalLookupOptions {
    pub foreign_table_id: TableId,
    pub lookup_field_id: FieldId,
    pub condition: FieldCondition,
}

/// Aggregates a foreign field over the rows selected by a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalRollupConfig {
    #[serde(flatten)]
    pub options: ConditionalLookupOptions,
    pub expression: RollupFunction,
}

/// Aggregation applied by rollups.
///
/// The textual form mirrors the user-facing expression, e.g. `sum({values})`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupFunction {
    /// Non-empty values.
    Count,
    /// Linked rows, empty or not.
    CountAll,
    /// Non-blank values.
    CountA,
    Sum,
    Average,
    Max,
    Min,
    And,
    Or,
    Xor,
    ArrayJoin,
    ArrayUnique,
    ArrayCompact,
    Concatenate,
}

const ALL_ROLLUPS: [RollupFunction; 14] = [
    RollupFunction::Count,
    RollupFunction::CountAll,
    RollupFunction::CountA,
    RollupFunction::Sum,
    RollupFunction::Average,
    RollupFunction::Max,
    RollupFunction::Min,
    RollupFunction::And,
    RollupFunction::Or,
    RollupFunction::Xor,
    RollupFunction::ArrayJoin,
    RollupFunction::ArrayUnique,
    RollupFunction::ArrayCompact,
    RollupFunction::Concatenate,
];

impl RollupFunction {
    pub fn name(self) -> &'static str {
        match self {
            RollupFunction::Count => "count",
            RollupFunction::CountAll => "countall",
            RollupFunction::CountA => "counta",
            RollupFunction::Sum => "sum",
            RollupFunction::Average => "average",
            RollupFunction::Max => "max",
            RollupFunction::Min => "min",
            RollupFunction::And => "and",
            RollupFunction::Or => "or",
            RollupFunction::Xor => "xor",
            RollupFunction::ArrayJoin => "array_join",
            RollupFunction::ArrayUnique => "array_unique",
            RollupFunction::ArrayCompact => "array_compact",
            RollupFunction::Concatenate => "concatenate",
        }
    }

    /// Shape of the aggregated value given the shape of the source field.
    pub fn result_shape(self, source: ValueShape) -> ValueShape {
        match self {
            RollupFunction::Count
            | RollupFunction::CountAll
            | RollupFunction::CountA
            | RollupFunction::Sum
            | RollupFunction::Average => ValueShape::scalar(CellValueType::Number),
            RollupFunction::Max | RollupFunction::Min => ValueShape::scalar(source.cell_type),
            RollupFunction::And | RollupFunction::Or | RollupFunction::Xor => {
                ValueShape::scalar(CellValueType::Boolean)
            }
            RollupFunction::ArrayJoin | RollupFunction::Concatenate => {
                ValueShape::scalar(CellValueType::String)
            }
            RollupFunction::ArrayUnique | RollupFunction::ArrayCompact => {
                ValueShape::multiple(source.cell_type)
            }
        }
    }

    /// Whether the function is meaningful for values of `source` type.
    pub fn accepts(self, source: CellValueType) -> bool {
        match self {
            RollupFunction::Sum | RollupFunction::Average => source == CellValueType::Number,
            RollupFunction::Max | RollupFunction::Min => {
                matches!(source, CellValueType::Number | CellValueType::DateTime)
            }
            _ => true,
        }
    }
}

impl fmt::Display for RollupFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({{values}})", self.name())
    }
}

impl FromStr for RollupFunction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let name = compact
            .strip_suffix("({values})")
            .ok_or_else(|| CoreError::validation("rollup", format!("malformed rollup expression '{s}'")))?;
        ALL_ROLLUPS
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| CoreError::validation("rollup", format!("unknown rollup function '{name}'")))
    }
}

impl Serialize for RollupFunction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RollupFunction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
