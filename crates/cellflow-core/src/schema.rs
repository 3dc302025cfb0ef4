//! Tables and the schema: the id-indexed collection every component reads
//! field configuration from.
//!
//! [`Schema::validate_field`] is the boundary check run before a field is
//! created or converted. Dangling references discovered *later* (a foreign
//! table or field deleted after the fact) are not validation failures; the
//! graph builder reports them as broken fields instead.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::field::{Field, FieldKind};
use crate::formula::Formula;
use crate::id::{FieldId, TableId};
use crate::value::ValueShape;

/// A table and its fields, in display order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub fields: Vec<Field>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            id: TableId::generate(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: TableId) -> Self {
        self.id = id;
        self
    }

    /// Physical table holding this table's records.
    pub fn db_table_name(&self) -> &str {
        self.id.as_str()
    }

    pub fn field(&self, id: &FieldId) -> Option<&Field> {
        self.fields.iter().find(|f| &f.id == id)
    }

    pub fn field_mut(&mut self, id: &FieldId) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| &f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The primary field, falling back to the first field.
    pub fn primary_field(&self) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.is_primary)
            .or_else(|| self.fields.first())
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_computed())
    }
}

/// All tables, keyed by id in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    tables: IndexMap<TableId, Table>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table(&mut self, table: Table) {
        self.tables.insert(table.id.clone(), table);
    }

    pub fn remove_table(&mut self, id: &TableId) -> Option<Table> {
        self.tables.shift_remove(id)
    }

    pub fn table(&self, id: &TableId) -> Option<&Table> {
        self.tables.get(id)
    }

    pub fn table_mut(&mut self, id: &TableId) -> Option<&mut Table> {
        self.tables.get_mut(id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    pub fn contains_table(&self, id: &TableId) -> bool {
        self.tables.contains_key(id)
    }

    pub fn field(&self, id: &FieldId) -> Option<&Field> {
        self.tables.values().find_map(|t| t.field(id))
    }

    pub fn field_mut(&mut self, id: &FieldId) -> Option<&mut Field> {
        self.tables.values_mut().find_map(|t| t.field_mut(id))
    }

    /// Id of the table owning `field`.
    pub fn table_of_field(&self, field: &FieldId) -> Option<&TableId> {
        self.tables
            .values()
            .find(|t| t.field(field).is_some())
            .map(|t| &t.id)
    }

    /// Every field with the id of its owning table.
    pub fn fields(&self) -> impl Iterator<Item = (&TableId, &Field)> {
        self.tables
            .values()
            .flat_map(|t| t.fields.iter().map(move |f| (&t.id, f)))
    }

    /// Appends a field to a table after boundary validation.
    pub fn add_field(&mut self, table_id: &TableId, field: Field) -> Result<(), CoreError> {
        self.validate_field(table_id, &field)?;
        let table = self
            .tables
            .get_mut(table_id)
            .ok_or_else(|| CoreError::UnknownTable { id: table_id.clone() })?;
        table.fields.push(field);
        Ok(())
    }

    /// Replaces a field's definition in place, keeping its position.
    pub fn replace_field(&mut self, field: Field) -> Result<Field, CoreError> {
        let slot = self
            .field_mut(&field.id)
            .ok_or_else(|| CoreError::UnknownField { id: field.id.clone() })?;
        Ok(std::mem::replace(slot, field))
    }

    pub fn remove_field(&mut self, id: &FieldId) -> Option<Field> {
        for table in self.tables.values_mut() {
            if let Some(pos) = table.fields.iter().position(|f| &f.id == id) {
                return Some(table.fields.remove(pos));
            }
        }
        None
    }

    /// Persisted value shape of a field, `None` when it cannot be resolved.
    pub fn shape_of(&self, field: &FieldId) -> Option<ValueShape> {
        let field = self.field(field)?;
        Some(crate::shape::field_shape(self, field))
    }

    // -----------------------------------------------------------------------
    // Boundary validation
    // -----------------------------------------------------------------------

    /// Rejects malformed configuration before graph construction.
    ///
    /// `table_id` is the table the field belongs (or will belong) to. A
    /// field being converted is validated against the schema that still
    /// contains its previous definition; its own name does not clash.
    pub fn validate_field(&self, table_id: &TableId, field: &Field) -> Result<(), CoreError> {
        let table = self
            .table(table_id)
            .ok_or_else(|| CoreError::UnknownTable { id: table_id.clone() })?;
        if field.name.trim().is_empty() {
            return Err(CoreError::validation(&field.id, "field name must not be empty"));
        }
        if table
            .fields
            .iter()
            .any(|f| f.id != field.id && f.name == field.name)
        {
            return Err(CoreError::validation(
                &field.id,
                format!("table '{}' already has a field named '{}'", table.name, field.name),
            ));
        }
        if let Some(owner) = self.table_of_field(&field.id) {
            if owner != table_id {
                return Err(CoreError::validation(
                    &field.id,
                    format!("field id already belongs to table {owner}"),
                ));
            }
        }

        match &field.kind {
            FieldKind::Number { precision } if *precision > 10 => Err(CoreError::validation(
                &field.id,
                format!("number precision must be at most 10, got {precision}"),
            )),
            FieldKind::Link(cfg) => {
                let foreign = self.table(&cfg.foreign_table_id).ok_or_else(|| {
                    CoreError::validation(
                        &field.id,
                        format!("link foreign table {} does not exist", cfg.foreign_table_id),
                    )
                })?;
                if foreign.field(&cfg.lookup_field_id).is_none() {
                    return Err(CoreError::validation(
                        &field.id,
                        format!(
                            "link lookup field {} is not a field of table {}",
                            cfg.lookup_field_id, cfg.foreign_table_id
                        ),
                    ));
                }
                Ok(())
            }
            FieldKind::Formula(options) => {
                let formula = Formula::parse(&options.expression)?;
                for reference in formula.references() {
                    if reference == field.id {
                        return Err(CoreError::DependencyCycle {
                            cycle: vec![field.id.clone()],
                        });
                    }
                    if table.field(&reference).is_none() {
                        return Err(CoreError::UnknownField { id: reference });
                    }
                }
                Ok(())
            }
            FieldKind::Lookup(options) => self.validate_lookup(table_id, field, options),
            FieldKind::Rollup(cfg) => {
                self.validate_lookup(table_id, field, &cfg.options)?;
                self.validate_rollup_source(field, &cfg.options.lookup_field_id, cfg.expression)
            }
            FieldKind::ConditionalRollup(cfg) => {
                let opts = &cfg.options;
                let foreign = self.table(&opts.foreign_table_id).ok_or_else(|| {
                    CoreError::validation(
                        &field.id,
                        format!("foreign table {} does not exist", opts.foreign_table_id),
                    )
                })?;
                if foreign.field(&opts.lookup_field_id).is_none() {
                    return Err(CoreError::validation(
                        &field.id,
                        format!("lookup field {} is not on the foreign table", opts.lookup_field_id),
                    ));
                }
                opts.condition.validate(&field.id)?;
                for foreign_field in opts.condition.referenced_foreign_fields() {
                    if foreign.field(&foreign_field).is_none() {
                        return Err(CoreError::validation(
                            &field.id,
                            format!("condition field {foreign_field} is not on the foreign table"),
                        ));
                    }
                }
                for host_field in opts.condition.referenced_host_fields() {
                    if table.field(&host_field).is_none() {
                        return Err(CoreError::UnknownField { id: host_field });
                    }
                }
                self.validate_rollup_source(field, &opts.lookup_field_id, cfg.expression)
            }
            _ => Ok(()),
        }
    }

    fn validate_lookup(
        &self,
        table_id: &TableId,
        field: &Field,
        options: &crate::lookup::LookupOptions,
    ) -> Result<(), CoreError> {
        let table = self
            .table(table_id)
            .ok_or_else(|| CoreError::UnknownTable { id: table_id.clone() })?;
        let link = table
            .field(&options.link_field_id)
            .and_then(Field::link_config)
            .ok_or_else(|| {
                CoreError::validation(
                    &field.id,
                    format!("{} is not a link field of this table", options.link_field_id),
                )
            })?;
        if link.foreign_table_id != options.foreign_table_id {
            return Err(CoreError::validation(
                &field.id,
                format!(
                    "link {} points to {}, not {}",
                    options.link_field_id, link.foreign_table_id, options.foreign_table_id
                ),
            ));
        }
        let foreign = self.table(&options.foreign_table_id).ok_or_else(|| {
            CoreError::validation(
                &field.id,
                format!("foreign table {} does not exist", options.foreign_table_id),
            )
        })?;
        if foreign.field(&options.lookup_field_id).is_none() {
            return Err(CoreError::validation(
                &field.id,
                format!("lookup field {} is not on the foreign table", options.lookup_field_id),
            ));
        }
        Ok(())
    }

    fn validate_rollup_source(
        &self,
        field: &Field,
        source: &FieldId,
        expression: crate::lookup::RollupFunction,
    ) -> Result<(), CoreError> {
        if let Some(shape) = self.shape_of(source) {
            if !expression.accepts(shape.cell_type) {
                return Err(CoreError::validation(
                    &field.id,
                    format!("{expression} cannot aggregate {:?} values", shape.cell_type),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Relationship;
    use crate::lookup::{LookupOptions, RollupFunction};

    fn tid(c: char) -> TableId {
        TableId::parse(format!("tbl{}", c.to_string().repeat(16))).unwrap()
    }

    fn fid(c: char) -> FieldId {
        FieldId::parse(format!("fld{}", c.to_string().repeat(16))).unwrap()
    }

    fn two_tables() -> Schema {
        let mut schema = Schema::new();
        let mut t1 = Table::new("Orders").with_id(tid('A'));
        t1.fields.push(Field::text("Title").with_id(fid('A')).primary());
        t1.fields.push(Field::number("Amount").with_id(fid('B')));
        let mut t2 = Table::new("Customers").with_id(tid('B'));
        t2.fields.push(Field::text("Name").with_id(fid('C')).primary());
        schema.insert_table(t1);
        schema.insert_table(t2);
        schema
    }

    #[test]
    fn lookup_helpers() {
        let schema = two_tables();
        assert_eq!(schema.table_of_field(&fid('C')), Some(&tid('B')));
        assert_eq!(schema.field(&fid('B')).unwrap().name, "Amount");
        assert_eq!(schema.fields().count(), 3);
    }

    #[test]
    fn formula_with_unknown_reference_is_rejected() {
        let schema = two_tables();
        let field = Field::formula("F", format!("{{{}}} + 1", fid('Z')));
        assert_eq!(
            schema.validate_field(&tid('A'), &field),
            Err(CoreError::UnknownField { id: fid('Z') })
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let schema = two_tables();
        let err = schema.validate_field(&tid('A'), &Field::text("Amount")).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn link_to_missing_table_is_rejected() {
        let schema = two_tables();
        let link = Field::link("L", Relationship::ManyOne, tid('Z'), fid('C'));
        assert!(schema.validate_field(&tid('A'), &link).is_err());
    }

    #[test]
    fn rollup_requires_a_link_and_a_compatible_source() {
        let mut schema = two_tables();
        let link = Field::link("Orders", Relationship::ManyMany, tid('A'), fid('A')).with_id(fid('L'));
        schema.add_field(&tid('B'), link).unwrap();

        let ok = Field::rollup(
            "Total",
            LookupOptions {
                link_field_id: fid('L'),
                foreign_table_id: tid('A'),
                lookup_field_id: fid('B'),
            },
            RollupFunction::Sum,
        );
        assert!(schema.validate_field(&tid('B'), &ok).is_ok());

        let text_sum = Field::rollup(
            "Bad",
            LookupOptions {
                link_field_id: fid('L'),
                foreign_table_id: tid('A'),
                lookup_field_id: fid('A'),
            },
            RollupFunction::Sum,
        );
        assert!(schema.validate_field(&tid('B'), &text_sum).is_err());

        let no_link = Field::rollup(
            "NoLink",
            LookupOptions {
                link_field_id: fid('C'),
                foreign_table_id: tid('A'),
                lookup_field_id: fid('B'),
            },
            RollupFunction::Sum,
        );
        assert!(schema.validate_field(&tid('B'), &no_link).is_err());
    }
}
