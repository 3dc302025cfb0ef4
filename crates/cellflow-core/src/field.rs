//! The field model: identity plus a closed set of variant configurations.

use serde::{Deserialize, Serialize};

use crate::id::{FieldId, TableId};
use crate::link::{LinkFieldConfig, Relationship};
use crate::lookup::{
    ConditionalLookupOptions, ConditionalRollupConfig, LookupOptions, RollupFieldConfig,
    RollupFunction,
};
use crate::condition::FieldCondition;

/// Options of a formula field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaOptions {
    pub expression: String,
}

/// Per-variant configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "options", rename_all = "camelCase")]
pub enum FieldKind {
    SingleLineText,
    LongText,
    Number {
        #[serde(default)]
        precision: u8,
    },
    Checkbox,
    SingleSelect {
        #[serde(default)]
        choices: Vec<String>,
    },
    Date,
    Link(LinkFieldConfig),
    Formula(FormulaOptions),
    Lookup(LookupOptions),
    Rollup(RollupFieldConfig),
    ConditionalRollup(ConditionalRollupConfig),
}

impl FieldKind {
    /// Short tag used in logs and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::SingleLineText => "singleLineText",
            FieldKind::LongText => "longText",
            FieldKind::Number { .. } => "number",
            FieldKind::Checkbox => "checkbox",
            FieldKind::SingleSelect { .. } => "singleSelect",
            FieldKind::Date => "date",
            FieldKind::Link(_) => "link",
            FieldKind::Formula(_) => "formula",
            FieldKind::Lookup(_) => "lookup",
            FieldKind::Rollup(_) => "rollup",
            FieldKind::ConditionalRollup(_) => "conditionalRollup",
        }
    }
}

/// A field of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: FieldId,
    pub name: String,
    pub kind: FieldKind,
    /// Set when a reference this field needs can no longer be resolved.
    #[serde(default)]
    pub has_error: bool,
    #[serde(default)]
    pub is_primary: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Field {
            id: FieldId::generate(),
            name: name.into(),
            kind,
            has_error: false,
            is_primary: false,
        }
    }

    pub fn with_id(mut self, id: FieldId) -> Self {
        self.id = id;
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    // -----------------------------------------------------------------------
    // Constructors for the common variants
    // -----------------------------------------------------------------------

    pub fn text(name: impl Into<String>) -> Self {
        Field::new(name, FieldKind::SingleLineText)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Field::new(name, FieldKind::Number { precision: 2 })
    }

    pub fn formula(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Field::new(
            name,
            FieldKind::Formula(FormulaOptions {
                expression: expression.into(),
            }),
        )
    }

    pub fn link(
        name: impl Into<String>,
        relationship: Relationship,
        foreign_table_id: TableId,
        lookup_field_id: FieldId,
    ) -> Self {
        Field::new(
            name,
            FieldKind::Link(LinkFieldConfig::new(relationship, foreign_table_id, lookup_field_id)),
        )
    }

    pub fn lookup(name: impl Into<String>, options: LookupOptions) -> Self {
        Field::new(name, FieldKind::Lookup(options))
    }

    pub fn rollup(name: impl Into<String>, options: LookupOptions, expression: RollupFunction) -> Self {
        Field::new(name, FieldKind::Rollup(RollupFieldConfig { options, expression }))
    }

    pub fn conditional_rollup(
        name: impl Into<String>,
        foreign_table_id: TableId,
        lookup_field_id: FieldId,
        condition: FieldCondition,
        expression: RollupFunction,
    ) -> Self {
        Field::new(
            name,
            FieldKind::ConditionalRollup(ConditionalRollupConfig {
                options: ConditionalLookupOptions {
                    foreign_table_id,
                    lookup_field_id,
                    condition,
                },
                expression,
            }),
        )
    }

    // -----------------------------------------------------------------------
    // Derived properties
    // -----------------------------------------------------------------------

    /// Physical column holding this field's persisted value.
    pub fn db_field_name(&self) -> &str {
        self.id.as_str()
    }

    /// Whether the field's value is derived rather than written by users.
    ///
    /// Link fields count as computed: their display value is derived from
    /// key storage and the foreign title field.
    pub fn is_computed(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Link(_)
                | FieldKind::Formula(_)
                | FieldKind::Lookup(_)
                | FieldKind::Rollup(_)
                | FieldKind::ConditionalRollup(_)
        )
    }

    pub fn link_config(&self) -> Option<&LinkFieldConfig> {
        match &self.kind {
            FieldKind::Link(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub fn link_config_mut(&mut self) -> Option<&mut LinkFieldConfig> {
        match &mut self.kind {
            FieldKind::Link(cfg) => Some(cfg),
            _ => None,
        }
    }

    /// Lookup-style options (lookups and rollups) reaching through a link.
    pub fn lookup_options(&self) -> Option<&LookupOptions> {
        match &self.kind {
            FieldKind::Lookup(options) => Some(options),
            FieldKind::Rollup(cfg) => Some(&cfg.options),
            _ => None,
        }
    }
}
