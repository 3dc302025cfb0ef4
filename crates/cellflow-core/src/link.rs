//! Link relationships and the link field's configuration value object.
//!
//! A [`LinkFieldConfig`] starts life with only the user-facing options
//! (relationship, foreign table, lookup field, one-way flag). Once the link
//! symmetric manager materializes the key storage, the foreign-key host
//! table, key column names and (for two-way links) the symmetric field id
//! are fixed. Re-setting any of them to a different value is an invariant
//! violation.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{FieldId, TableId};

/// Column holding a record's primary key in every physical table.
pub const ID_COLUMN: &str = "__id";

/// Column holding a record's insertion ordinal in every physical table.
pub const AUTO_NUMBER_COLUMN: &str = "__auto_number";

/// Cardinality of a link between two tables, seen from the host table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    OneOne,
    OneMany,
    ManyOne,
    ManyMany,
}

impl Relationship {
    /// The relationship as seen from the foreign table.
    pub fn reverse(self) -> Relationship {
        match self {
            Relationship::OneOne => Relationship::OneOne,
            Relationship::OneMany => Relationship::ManyOne,
            Relationship::ManyOne => Relationship::OneMany,
            Relationship::ManyMany => Relationship::ManyMany,
        }
    }

    /// Whether a host record can link to more than one foreign record.
    pub fn is_multiple(self) -> bool {
        matches!(self, Relationship::OneMany | Relationship::ManyMany)
    }
}

/// Configuration of a link field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkFieldConfig {
    pub relationship: Relationship,
    pub foreign_table_id: TableId,
    /// Field on the foreign table whose value is the link's display title.
    pub lookup_field_id: FieldId,
    #[serde(default)]
    pub is_one_way: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fk_host_table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    self_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    foreign_key_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    symmetric_field_id: Option<FieldId>,
}

/// The physical key storage backing a link.
///
/// In table `fk_host_table_name`, column `self_key_name` holds the host
/// record id and column `foreign_key_name` holds the linked foreign record
/// id. This single shape covers junction tables, a foreign key on the host
/// table and a foreign key on the foreign table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkDbConfig {
    pub fk_host_table_name: String,
    pub self_key_name: String,
    pub foreign_key_name: String,
}

impl LinkFieldConfig {
    pub fn new(
        relationship: Relationship,
        foreign_table_id: TableId,
        lookup_field_id: FieldId,
    ) -> Self {
        LinkFieldConfig {
            relationship,
            foreign_table_id,
            lookup_field_id,
            is_one_way: false,
            fk_host_table_name: None,
            self_key_name: None,
            foreign_key_name: None,
            symmetric_field_id: None,
        }
    }

    pub fn one_way(mut self) -> Self {
        self.is_one_way = true;
        self
    }

    pub fn fk_host_table_name(&self) -> Option<&str> {
        self.fk_host_table_name.as_deref()
    }

    pub fn self_key_name(&self) -> Option<&str> {
        self.self_key_name.as_deref()
    }

    pub fn foreign_key_name(&self) -> Option<&str> {
        self.foreign_key_name.as_deref()
    }

    pub fn symmetric_field_id(&self) -> Option<&FieldId> {
        self.symmetric_field_id.as_ref()
    }

    /// Returns the materialized key storage, if all three parts are set.
    pub fn db_config(&self) -> Option<LinkDbConfig> {
        Some(LinkDbConfig {
            fk_host_table_name: self.fk_host_table_name.clone()?,
            self_key_name: self.self_key_name.clone()?,
            foreign_key_name: self.foreign_key_name.clone()?,
        })
    }

    /// Fixes the key storage. Setting the same values again is a no-op;
    /// setting different values fails.
    pub fn set_db_config(&mut self, owner: &FieldId, db: LinkDbConfig) -> Result<(), CoreError> {
        set_once(owner, "fkHostTableName", &mut self.fk_host_table_name, db.fk_host_table_name)?;
        set_once(owner, "selfKeyName", &mut self.self_key_name, db.self_key_name)?;
        set_once(owner, "foreignKeyName", &mut self.foreign_key_name, db.foreign_key_name)?;
        Ok(())
    }

    /// Fixes the symmetric field. Rejected for one-way links and for a
    /// conflicting re-set.
    pub fn set_symmetric_field_id(
        &mut self,
        owner: &FieldId,
        symmetric: FieldId,
    ) -> Result<(), CoreError> {
        if self.is_one_way {
            return Err(CoreError::InvariantViolation {
                field: owner.clone(),
                reason: "one-way links cannot have a symmetric field".to_string(),
            });
        }
        set_once(owner, "symmetricFieldId", &mut self.symmetric_field_id, symmetric)
    }

    /// Drops the symmetric pointer once the mirror has been removed (the
    /// foreign side was deleted, or the link was converted to one-way).
    pub fn clear_symmetric_field_id(&mut self) {
        self.symmetric_field_id = None;
    }

    /// Whether the link cell holds a list of records.
    pub fn is_multiple(&self) -> bool {
        self.relationship.is_multiple()
    }

    /// Whether both endpoints of the link live in the same table.
    pub fn is_self_link(&self, host: &TableId) -> bool {
        &self.foreign_table_id == host
    }
}

fn set_once<T: PartialEq + std::fmt::Debug>(
    owner: &FieldId,
    name: &str,
    slot: &mut Option<T>,
    value: T,
) -> Result<(), CoreError> {
    match slot {
        Some(existing) if *existing == value => Ok(()),
        Some(existing) => Err(CoreError::InvariantViolation {
            field: owner.clone(),
            reason: format!("{name} is already set to {existing:?}, refusing to change it to {value:?}"),
        }),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Deterministic key naming
// ---------------------------------------------------------------------------

/// Junction table allocated for a link field.
pub fn junction_table_name(field_id: &FieldId) -> String {
    format!("junction_{field_id}")
}

/// Foreign-key column named after a field.
pub fn fk_column(field_id: &FieldId) -> String {
    format!("__fk_{field_id}")
}

/// Self-key column of a one-way link's junction table.
pub fn one_way_self_key(field_id: &FieldId) -> String {
    format!("__fk_rad_{field_id}")
}
