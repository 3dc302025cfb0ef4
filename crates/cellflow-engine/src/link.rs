//! Link key storage and symmetric fields.
//!
//! Creating a link field fixes where its keys live and, for two-way links,
//! creates the mirror field on the foreign table. Deleting either side of a
//! two-way link removes the other side and the key storage. The work is
//! described as [`LinkSideEffect`]s by [`LinkSideEffectVisitor`]; the engine
//! applies them to the schema and the store.
//!
//! Key layouts, for host field `f` with mirror `s`:
//!
//! | relationship          | key table        | self key        | foreign key |
//! |-----------------------|------------------|-----------------|-------------|
//! | ManyMany, two-way     | `junction_<f>`   | `__fk_<s>`      | `__fk_<f>`  |
//! | ManyMany/OneMany, one-way | `junction_<f>` | `__fk_rad_<f>` | `__fk_<f>`  |
//! | ManyOne, OneOne       | host table       | `__id`          | `__fk_<f>`  |
//! | OneMany, two-way      | foreign table    | `__fk_<s>`      | `__id`      |
//!
//! A mirror's key storage is the same triple with self and foreign keys
//! swapped.

use std::collections::HashSet;

use cellflow_core::field::FormulaOptions;
use cellflow_core::link::{fk_column, junction_table_name, one_way_self_key, ID_COLUMN};
use cellflow_core::lookup::{ConditionalRollupConfig, LookupOptions, RollupFieldConfig};
use cellflow_core::{
    CoreError, Field, FieldId, FieldKind, FieldVisitor, LinkDbConfig, LinkFieldConfig,
    Relationship, Schema, Table, TableId,
};

use crate::error::EngineError;

/// Upper bound on `"<name> N"` candidates tried for a mirror field name.
pub const MAX_SYMMETRIC_NAME_ATTEMPTS: usize = 100;

/// One schema or storage change implied by creating or deleting a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSideEffect {
    /// Add the (fully configured) mirror field to `table_id`.
    CreateField { table_id: TableId, field: Field },
    /// Remove the mirror field. Its own link storage is not touched again.
    DeleteField { field_id: FieldId },
    CreateJunction {
        name: String,
        self_key: String,
        foreign_key: String,
    },
    DropJunction { name: String },
    AddForeignKeyColumn { table: String, column: String },
    DropForeignKeyColumn { table: String, column: String },
}

/// Key storage and mirror chosen for a new link, plus the effects that
/// realize them.
#[derive(Debug, Clone, Default)]
pub struct LinkPlan {
    pub db: Option<LinkDbConfig>,
    pub symmetric_field_id: Option<FieldId>,
    pub effects: Vec<LinkSideEffect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Create,
    Delete,
}

/// Computes the side effects of creating or deleting a field.
///
/// Every variant except links has none.
pub struct LinkSideEffectVisitor<'a> {
    schema: &'a Schema,
    table_id: &'a TableId,
    mode: Mode,
}

impl<'a> LinkSideEffectVisitor<'a> {
    pub fn creating(schema: &'a Schema, table_id: &'a TableId) -> Self {
        LinkSideEffectVisitor {
            schema,
            table_id,
            mode: Mode::Create,
        }
    }

    pub fn deleting(schema: &'a Schema, table_id: &'a TableId) -> Self {
        LinkSideEffectVisitor {
            schema,
            table_id,
            mode: Mode::Delete,
        }
    }

    fn table(&self, id: &TableId) -> Result<&'a Table, EngineError> {
        self.schema
            .table(id)
            .ok_or_else(|| EngineError::NotFound(format!("table {id}")))
    }

    fn plan_create(&self, field: &Field, config: &LinkFieldConfig) -> Result<LinkPlan, EngineError> {
        if config.db_config().is_some() || config.symmetric_field_id().is_some() {
            return Err(EngineError::Rejected(format!(
                "link {} already carries key storage; it is assigned on creation",
                field.id
            )));
        }
        let host = self.table(self.table_id)?;
        let foreign = self.table(&config.foreign_table_id)?;
        let f = &field.id;
        let symmetric = (!config.is_one_way).then(FieldId::generate);

        let mut effects = Vec::new();
        let db = match (config.relationship, &symmetric) {
            (Relationship::ManyMany, Some(s)) => {
                junction(f, fk_column(s), fk_column(f), &mut effects)
            }
            (Relationship::ManyMany | Relationship::OneMany, None) => {
                junction(f, one_way_self_key(f), fk_column(f), &mut effects)
            }
            (Relationship::ManyOne | Relationship::OneOne, _) => {
                let db = LinkDbConfig {
                    fk_host_table_name: host.db_table_name().to_string(),
                    self_key_name: ID_COLUMN.to_string(),
                    foreign_key_name: fk_column(f),
                };
                effects.push(LinkSideEffect::AddForeignKeyColumn {
                    table: db.fk_host_table_name.clone(),
                    column: db.foreign_key_name.clone(),
                });
                db
            }
            (Relationship::OneMany, Some(s)) => {
                let db = LinkDbConfig {
                    fk_host_table_name: foreign.db_table_name().to_string(),
                    self_key_name: fk_column(s),
                    foreign_key_name: ID_COLUMN.to_string(),
                };
                effects.push(LinkSideEffect::AddForeignKeyColumn {
                    table: db.fk_host_table_name.clone(),
                    column: db.self_key_name.clone(),
                });
                db
            }
        };

        if let Some(s) = &symmetric {
            let title = host.primary_field().ok_or_else(|| {
                EngineError::Rejected(format!("table {} has no primary field to title links", host.id))
            })?;
            let mut taken: HashSet<&str> = foreign.fields.iter().map(|f| f.name.as_str()).collect();
            if config.is_self_link(&host.id) {
                taken.insert(field.name.as_str());
            }
            let name = symmetric_name(&host.name, &taken)?;

            let mut mirror = LinkFieldConfig::new(
                config.relationship.reverse(),
                host.id.clone(),
                title.id.clone(),
            );
            mirror.set_db_config(s, reversed(&db))?;
            mirror.set_symmetric_field_id(s, f.clone())?;
            effects.push(LinkSideEffect::CreateField {
                table_id: foreign.id.clone(),
                field: Field::new(name, FieldKind::Link(mirror)).with_id(s.clone()),
            });
        }

        Ok(LinkPlan {
            db: Some(db),
            symmetric_field_id: symmetric,
            effects,
        })
    }

    fn plan_delete(&self, config: &LinkFieldConfig) -> LinkPlan {
        let mut effects = Vec::new();
        if let Some(db) = config.db_config() {
            let effect = if db.self_key_name == ID_COLUMN {
                LinkSideEffect::DropForeignKeyColumn {
                    table: db.fk_host_table_name,
                    column: db.foreign_key_name,
                }
            } else if db.foreign_key_name == ID_COLUMN {
                LinkSideEffect::DropForeignKeyColumn {
                    table: db.fk_host_table_name,
                    column: db.self_key_name,
                }
            } else {
                LinkSideEffect::DropJunction {
                    name: db.fk_host_table_name,
                }
            };
            effects.push(effect);
        }
        if let Some(s) = config.symmetric_field_id() {
            if self.schema.field(s).is_some() {
                effects.push(LinkSideEffect::DeleteField { field_id: s.clone() });
            }
        }
        LinkPlan {
            effects,
            ..LinkPlan::default()
        }
    }
}

fn junction(
    field_id: &FieldId,
    self_key: String,
    foreign_key: String,
    effects: &mut Vec<LinkSideEffect>,
) -> LinkDbConfig {
    let name = junction_table_name(field_id);
    effects.push(LinkSideEffect::CreateJunction {
        name: name.clone(),
        self_key: self_key.clone(),
        foreign_key: foreign_key.clone(),
    });
    LinkDbConfig {
        fk_host_table_name: name,
        self_key_name: self_key,
        foreign_key_name: foreign_key,
    }
}

/// The mirror's view of the same key storage.
pub fn reversed(db: &LinkDbConfig) -> LinkDbConfig {
    LinkDbConfig {
        fk_host_table_name: db.fk_host_table_name.clone(),
        self_key_name: db.foreign_key_name.clone(),
        foreign_key_name: db.self_key_name.clone(),
    }
}

/// First free name among `base`, `"base 2"`, `"base 3"`, ...
pub fn symmetric_name(base: &str, taken: &HashSet<&str>) -> Result<String, EngineError> {
    if !taken.contains(base) {
        return Ok(base.to_string());
    }
    (2..=MAX_SYMMETRIC_NAME_ATTEMPTS)
        .map(|n| format!("{base} {n}"))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .ok_or_else(|| {
            EngineError::Rejected(format!(
                "no free name for the symmetric field of '{base}' after {MAX_SYMMETRIC_NAME_ATTEMPTS} attempts"
            ))
        })
}

impl FieldVisitor for LinkSideEffectVisitor<'_> {
    type Output = Result<LinkPlan, EngineError>;

    fn visit_single_line_text(&mut self, _field: &Field) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_long_text(&mut self, _field: &Field) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_number(&mut self, _field: &Field, _precision: u8) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_checkbox(&mut self, _field: &Field) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_single_select(&mut self, _field: &Field, _choices: &[String]) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_date(&mut self, _field: &Field) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_link(&mut self, field: &Field, config: &LinkFieldConfig) -> Self::Output {
        match self.mode {
            Mode::Create => self.plan_create(field, config),
            Mode::Delete => Ok(self.plan_delete(config)),
        }
    }

    fn visit_formula(&mut self, _field: &Field, _options: &FormulaOptions) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_lookup(&mut self, _field: &Field, _options: &LookupOptions) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_rollup(&mut self, _field: &Field, _config: &RollupFieldConfig) -> Self::Output {
        Ok(LinkPlan::default())
    }

    fn visit_conditional_rollup(
        &mut self,
        _field: &Field,
        _config: &ConditionalRollupConfig,
    ) -> Self::Output {
        Ok(LinkPlan::default())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Keeps two-way links and their mirrors consistent.
pub struct LinkSymmetricManager<'a> {
    schema: &'a Schema,
}

impl<'a> LinkSymmetricManager<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        LinkSymmetricManager { schema }
    }

    /// Fixes the key storage (and mirror id) of a field about to be created
    /// in `table_id`, returning the materialized field and its effects.
    pub fn prepare_create(
        &self,
        table_id: &TableId,
        mut field: Field,
    ) -> Result<(Field, Vec<LinkSideEffect>), EngineError> {
        let plan = field.accept(&mut LinkSideEffectVisitor::creating(self.schema, table_id))?;
        let owner = field.id.clone();
        if let Some(config) = field.link_config_mut() {
            if let Some(db) = plan.db {
                config.set_db_config(&owner, db)?;
            }
            if let Some(symmetric) = plan.symmetric_field_id {
                config.set_symmetric_field_id(&owner, symmetric)?;
            }
        }
        Ok((field, plan.effects))
    }

    /// Effects of deleting `field` from `table_id`.
    pub fn prepare_delete(&self, table_id: &TableId, field: &Field) -> Result<Vec<LinkSideEffect>, EngineError> {
        Ok(field
            .accept(&mut LinkSideEffectVisitor::deleting(self.schema, table_id))?
            .effects)
    }

    /// Checks that the link `field_id` and its mirror (if any) describe each
    /// other: exactly one mirror, reversed relationship, reversed key
    /// storage, pointing back.
    pub fn verify(&self, field_id: &FieldId) -> Result<(), CoreError> {
        let field = self
            .schema
            .field(field_id)
            .ok_or_else(|| CoreError::UnknownField { id: field_id.clone() })?;
        let host = self
            .schema
            .table_of_field(field_id)
            .ok_or_else(|| CoreError::UnknownField { id: field_id.clone() })?;
        let config = field.link_config().ok_or_else(|| CoreError::InvariantViolation {
            field: field_id.clone(),
            reason: "not a link field".to_string(),
        })?;
        let violation = |reason: &str| CoreError::InvariantViolation {
            field: field_id.clone(),
            reason: reason.to_string(),
        };

        let pointing_back = self
            .schema
            .fields()
            .filter(|(_, f)| {
                f.link_config()
                    .and_then(LinkFieldConfig::symmetric_field_id)
                    .is_some_and(|s| s == field_id)
            })
            .count();

        let Some(symmetric_id) = config.symmetric_field_id() else {
            return if pointing_back == 0 {
                Ok(())
            } else {
                Err(violation("a field claims to mirror a link without a symmetric field"))
            };
        };
        if config.is_one_way {
            return Err(violation("one-way link has a symmetric field"));
        }
        if pointing_back != 1 {
            return Err(violation("link must be mirrored by exactly one field"));
        }
        let mirror_table = self
            .schema
            .table_of_field(symmetric_id)
            .ok_or_else(|| violation("symmetric field does not exist"))?;
        let mirror = self
            .schema
            .field(symmetric_id)
            .and_then(Field::link_config)
            .ok_or_else(|| violation("symmetric field is not a link"))?;
        if mirror_table != &config.foreign_table_id || &mirror.foreign_table_id != host {
            return Err(violation("symmetric field lives on the wrong table"));
        }
        if mirror.relationship != config.relationship.reverse() {
            return Err(violation("symmetric relationship is not reversed"));
        }
        if mirror.db_config() != config.db_config().map(|db| reversed(&db)) {
            return Err(violation("symmetric key storage is not reversed"));
        }
        Ok(())
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

    /// Two tables `H` (Host) and `F` (Foreign), each with a primary field.
    fn schema() -> Schema {
        let mut schema = Schema::new();
        for (t, name, primary) in [('H', "Host", 'P'), ('F', "Foreign", 'Q')] {
            let mut table = Table::new(name).with_id(tid(t));
            table.fields.push(Field::text("Name").with_id(fid(primary)).primary());
            schema.insert_table(table);
        }
        schema
    }

    fn link(relationship: Relationship) -> Field {
        Field::link("Link", relationship, tid('F'), fid('Q')).with_id(fid('L'))
    }

    fn created(schema: &Schema, field: Field) -> (Field, Vec<LinkSideEffect>) {
        LinkSymmetricManager::new(schema)
            .prepare_create(&tid('H'), field)
            .unwrap()
    }

    fn mirror_of(effects: &[LinkSideEffect]) -> Option<(&TableId, &Field)> {
        effects.iter().find_map(|e| match e {
            LinkSideEffect::CreateField { table_id, field } => Some((table_id, field)),
            _ => None,
        })
    }

    #[test]
    fn two_way_many_many_uses_a_junction_and_a_mirror() {
        let schema = schema();
        let (field, effects) = created(&schema, link(Relationship::ManyMany));
        let config = field.link_config().unwrap();
        let s = config.symmetric_field_id().unwrap().clone();
        let db = config.db_config().unwrap();
        assert_eq!(db.fk_host_table_name, junction_table_name(&fid('L')));
        assert_eq!(db.self_key_name, fk_column(&s));
        assert_eq!(db.foreign_key_name, fk_column(&fid('L')));

        let (table, mirror) = mirror_of(&effects).unwrap();
        assert_eq!(table, &tid('F'));
        assert_eq!(mirror.name, "Host");
        let mirror_config = mirror.link_config().unwrap();
        assert_eq!(mirror_config.relationship, Relationship::ManyMany);
        assert_eq!(mirror_config.symmetric_field_id(), Some(&fid('L')));
        assert_eq!(mirror_config.db_config(), Some(reversed(&db)));
        assert_eq!(mirror_config.lookup_field_id, fid('P'));
    }

    #[test]
    fn one_way_links_never_get_a_mirror() {
        let schema = schema();
        for relationship in [Relationship::ManyMany, Relationship::OneMany, Relationship::ManyOne] {
            let mut field = link(relationship);
            if let FieldKind::Link(config) = &mut field.kind {
                config.is_one_way = true;
            }
            let (field, effects) = created(&schema, field);
            assert!(mirror_of(&effects).is_none());
            assert!(field.link_config().unwrap().symmetric_field_id().is_none());
        }
    }

    #[test]
    fn key_columns_follow_the_relationship() {
        let schema = schema();
        let (field, effects) = created(&schema, link(Relationship::ManyOne));
        let db = field.link_config().unwrap().db_config().unwrap();
        assert_eq!(db.fk_host_table_name, tid('H').to_string());
        assert_eq!(db.self_key_name, ID_COLUMN);
        assert!(effects.contains(&LinkSideEffect::AddForeignKeyColumn {
            table: tid('H').to_string(),
            column: fk_column(&fid('L')),
        }));
        let (_, mirror) = mirror_of(&effects).unwrap();
        assert_eq!(mirror.link_config().unwrap().relationship, Relationship::OneMany);

        let (field, _) = created(&schema, link(Relationship::OneMany));
        let config = field.link_config().unwrap();
        let db = config.db_config().unwrap();
        assert_eq!(db.fk_host_table_name, tid('F').to_string());
        assert_eq!(db.self_key_name, fk_column(config.symmetric_field_id().unwrap()));
        assert_eq!(db.foreign_key_name, ID_COLUMN);
    }

    #[test]
    fn mirror_names_are_deduplicated() {
        let taken: HashSet<&str> = ["Host", "Host 2"].into_iter().collect();
        assert_eq!(symmetric_name("Host", &taken).unwrap(), "Host 3");

        let names: Vec<String> = (2..=MAX_SYMMETRIC_NAME_ATTEMPTS).map(|n| format!("Host {n}")).collect();
        let mut all: HashSet<&str> = names.iter().map(String::as_str).collect();
        all.insert("Host");
        assert!(symmetric_name("Host", &all).is_err());
    }

    #[test]
    fn deleting_either_side_removes_the_other() {
        let mut schema = schema();
        let (field, effects) = created(&schema, link(Relationship::ManyMany));
        schema.add_field(&tid('H'), field.clone()).unwrap();
        let (table, mirror) = mirror_of(&effects).unwrap();
        schema.add_field(table, mirror.clone()).unwrap();
        let manager = LinkSymmetricManager::new(&schema);
        manager.verify(&field.id).unwrap();
        manager.verify(&mirror.id).unwrap();

        let effects = manager.prepare_delete(&tid('F'), mirror).unwrap();
        assert!(effects.contains(&LinkSideEffect::DeleteField {
            field_id: field.id.clone()
        }));
        assert!(effects.contains(&LinkSideEffect::DropJunction {
            name: junction_table_name(&fid('L'))
        }));
    }

    #[test]
    fn pre_materialized_links_are_rejected() {
        let schema = schema();
        let mut field = link(Relationship::ManyOne);
        field
            .link_config_mut()
            .unwrap()
            .set_db_config(
                &fid('L'),
                LinkDbConfig {
                    fk_host_table_name: "x".into(),
                    self_key_name: "y".into(),
                    foreign_key_name: "z".into(),
                },
            )
            .unwrap();
        let err = LinkSymmetricManager::new(&schema)
            .prepare_create(&tid('H'), field)
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected(_)));
    }
}
