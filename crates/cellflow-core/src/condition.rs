//! Filter conditions used by conditional rollups.
//!
//! A [`FieldCondition`] is a predicate tree over the *foreign* table plus an
//! optional sort and row limit. Leaves compare a foreign field against a
//! literal, a list of literals, a date, or a field on the *host* record. The
//! last form is what makes a conditional rollup depend on host fields even
//! though no link connects the two tables.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::FieldId;
use crate::value::CellValue;

/// Maximum row limit accepted on a condition.
pub const MAX_CONDITION_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterGroup {
    pub conjunction: Conjunction,
    pub items: Vec<FilterItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterItem {
    Group(FilterGroup),
    Leaf(FilterLeaf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterLeaf {
    /// Field on the foreign table being compared.
    pub field_id: FieldId,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    IsGreater,
    IsGreaterEqual,
    IsLess,
    IsLessEqual,
    IsEmpty,
    IsNotEmpty,
    IsAnyOf,
    IsNoneOf,
}

impl FilterOperator {
    /// Operators that take no comparison value.
    pub fn is_unary(self) -> bool {
        matches!(self, FilterOperator::IsEmpty | FilterOperator::IsNotEmpty)
    }

    /// Operators that compare against a list of values.
    pub fn takes_list(self) -> bool {
        matches!(self, FilterOperator::IsAnyOf | FilterOperator::IsNoneOf)
    }
}

/// Right-hand side of a filter leaf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum FilterValue {
    #[default]
    None,
    Literal(CellValue),
    List(Vec<CellValue>),
    Date(DateValue),
    /// A field on the host record.
    FieldRef(FieldId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "mode", content = "arg")]
pub enum DateValue {
    Today,
    Tomorrow,
    Yesterday,
    DaysAgo(u32),
    DaysFromNow(u32),
    /// ISO-8601 date (`YYYY-MM-DD`).
    Exact(String),
}

impl DateValue {
    /// Day offset relative to today, `None` for exact dates.
    pub fn day_offset(&self) -> Option<i64> {
        match self {
            DateValue::Today => Some(0),
            DateValue::Tomorrow => Some(1),
            DateValue::Yesterday => Some(-1),
            DateValue::DaysAgo(n) => Some(-i64::from(*n)),
            DateValue::DaysFromNow(n) => Some(i64::from(*n)),
            DateValue::Exact(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field_id: FieldId,
    #[serde(default)]
    pub descending: bool,
}

impl FieldCondition {
    /// Condition with a single `field = value` leaf.
    pub fn equals(field_id: FieldId, value: CellValue) -> Self {
        FieldCondition {
            filter: Some(FilterGroup {
                conjunction: Conjunction::And,
                items: vec![FilterItem::Leaf(FilterLeaf {
                    field_id,
                    operator: FilterOperator::Is,
                    value: FilterValue::Literal(value),
                })],
            }),
            sort: None,
            limit: None,
        }
    }

    /// Iterates every leaf of the filter tree, depth first.
    pub fn leaves(&self) -> Vec<&FilterLeaf> {
        let mut out = Vec::new();
        if let Some(group) = &self.filter {
            collect_leaves(group, &mut out);
        }
        out
    }

    /// Host-record fields referenced by the filter.
    pub fn referenced_host_fields(&self) -> Vec<FieldId> {
        let mut out = Vec::new();
        for leaf in self.leaves() {
            if let FilterValue::FieldRef(id) = &leaf.value {
                if !out.contains(id) {
                    out.push(id.clone());
                }
            }
        }
        out
    }

    /// Foreign-table fields read by the filter and the sort.
    pub fn referenced_foreign_fields(&self) -> Vec<FieldId> {
        let mut out: Vec<FieldId> = Vec::new();
        for leaf in self.leaves() {
            if !out.contains(&leaf.field_id) {
                out.push(leaf.field_id.clone());
            }
        }
        if let Some(sort) = &self.sort {
            if !out.contains(&sort.field_id) {
                out.push(sort.field_id.clone());
            }
        }
        out
    }

    /// Rejects malformed conditions before graph construction.
    pub fn validate(&self, owner: &FieldId) -> Result<(), CoreError> {
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_CONDITION_LIMIT {
                return Err(CoreError::validation(
                    owner,
                    format!("condition limit must be within 1..={MAX_CONDITION_LIMIT}, got {limit}"),
                ));
            }
        }
        for leaf in self.leaves() {
            let ok = match (&leaf.value, leaf.operator) {
                (FilterValue::None, op) => op.is_unary(),
                (_, op) if op.is_unary() => false,
                (FilterValue::List(_), op) => op.takes_list(),
                (_, op) => !op.takes_list(),
            };
            if !ok {
                return Err(CoreError::validation(
                    owner,
                    format!(
                        "operator {:?} does not accept value {:?} on field {}",
                        leaf.operator, leaf.value, leaf.field_id
                    ),
                ));
            }
            if let FilterValue::Date(DateValue::Exact(raw)) = &leaf.value {
                if !is_iso_date(raw) {
                    return Err(CoreError::validation(
                        owner,
                        format!("'{raw}' is not an ISO date (YYYY-MM-DD)"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn collect_leaves<'a>(group: &'a FilterGroup, out: &mut Vec<&'a FilterLeaf>) {
    for item in &group.items {
        match item {
            FilterItem::Leaf(leaf) => out.push(leaf),
            FilterItem::Group(inner) => collect_leaves(inner, out),
        }
    }
}

fn is_iso_date(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
}
