//! Value-shape inference, implemented as a [`FieldVisitor`].
//!
//! The persisted shape decides how the storage layer encodes a column
//! (native scalar vs. JSON text) and how the SQL compiler aggregates it.
//! Inference recurses through lookups and formulas; a depth bound keeps a
//! not-yet-rejected cycle from recursing forever.

use crate::field::{Field, FormulaOptions};
use crate::formula::{Formula, ShapeResolver};
use crate::id::FieldId;
use crate::link::LinkFieldConfig;
use crate::lookup::{ConditionalRollupConfig, LookupOptions, RollupFieldConfig};
use crate::schema::Schema;
use crate::value::{CellValueType, ValueShape};
use crate::visitor::FieldVisitor;

const MAX_DEPTH: usize = 32;

const FALLBACK: ValueShape = ValueShape::scalar(CellValueType::String);

/// Infers a field's persisted shape against `schema`.
pub fn field_shape(schema: &Schema, field: &Field) -> ValueShape {
    let mut visitor = ShapeVisitor {
        schema,
        depth: 0,
    };
    field.accept(&mut visitor)
}

pub struct ShapeVisitor<'a> {
    schema: &'a Schema,
    depth: usize,
}

impl ShapeVisitor<'_> {
    fn nested(&self, id: &FieldId) -> Option<ValueShape> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        let field = self.schema.field(id)?;
        let mut inner = ShapeVisitor {
            schema: self.schema,
            depth: self.depth + 1,
        };
        Some(field.accept(&mut inner))
    }

    fn through_link(&self, options: &LookupOptions) -> Option<(bool, ValueShape)> {
        let link = self.schema.field(&options.link_field_id)?.link_config()?.clone();
        let source = self.nested(&options.lookup_field_id)?;
        Some((link.is_multiple() || source.is_multiple, source))
    }
}

impl ShapeResolver for ShapeVisitor<'_> {
    fn shape_of(&self, field: &FieldId) -> Option<ValueShape> {
        self.nested(field)
    }
}

impl FieldVisitor for ShapeVisitor<'_> {
    type Output = ValueShape;

    fn visit_single_line_text(&mut self, _field: &Field) -> ValueShape {
        ValueShape::scalar(CellValueType::String)
    }

    fn visit_long_text(&mut self, _field: &Field) -> ValueShape {
        ValueShape::scalar(CellValueType::String)
    }

    fn visit_number(&mut self, _field: &Field, _precision: u8) -> ValueShape {
        ValueShape::scalar(CellValueType::Number)
    }

    fn visit_checkbox(&mut self, _field: &Field) -> ValueShape {
        ValueShape::scalar(CellValueType::Boolean)
    }

    fn visit_single_select(&mut self, _field: &Field, _choices: &[String]) -> ValueShape {
        ValueShape::scalar(CellValueType::String)
    }

    fn visit_date(&mut self, _field: &Field) -> ValueShape {
        ValueShape::scalar(CellValueType::DateTime)
    }

    /// Link cells hold `{id, title}` objects, always stored as JSON.
    fn visit_link(&mut self, _field: &Field, config: &LinkFieldConfig) -> ValueShape {
        ValueShape {
            cell_type: CellValueType::String,
            is_multiple: config.is_multiple(),
        }
    }

    fn visit_formula(&mut self, _field: &Field, options: &FormulaOptions) -> ValueShape {
        match Formula::parse(&options.expression) {
            Ok(formula) => formula.result_shape(&*self),
            Err(_) => FALLBACK,
        }
    }

    fn visit_lookup(&mut self, _field: &Field, options: &LookupOptions) -> ValueShape {
        match self.through_link(options) {
            Some((multiple, source)) => ValueShape {
                cell_type: source.cell_type,
                is_multiple: multiple,
            },
            None => FALLBACK,
        }
    }

    fn visit_rollup(&mut self, _field: &Field, config: &RollupFieldConfig) -> ValueShape {
        match self.through_link(&config.options) {
            Some((_, source)) => config.expression.result_shape(source),
            None => FALLBACK,
        }
    }

    fn visit_conditional_rollup(
        &mut self,
        _field: &Field,
        config: &ConditionalRollupConfig,
    ) -> ValueShape {
        match self.nested(&config.options.lookup_field_id) {
            Some(source) => config.expression.result_shape(source),
            None => FALLBACK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldKind;
    use crate::id::TableId;
    use crate::link::Relationship;
    use crate::lookup::RollupFunction;
    use crate::schema::Table;

    fn fid(c: char) -> FieldId {
        FieldId::parse(format!("fld{}", c.to_string().repeat(16))).unwrap()
    }

    #[test]
    fn shapes_follow_links_and_aggregates() {
        let t1 = TableId::parse("tblAAAAAAAAAAAAAAAA").unwrap();
        let t2 = TableId::parse("tblBBBBBBBBBBBBBBBB").unwrap();
        let mut schema = Schema::new();
        let mut orders = Table::new("Orders").with_id(t1.clone());
        orders.fields.push(Field::number("Amount").with_id(fid('A')));
        let mut customers = Table::new("Customers").with_id(t2.clone());
        customers
            .fields
            .push(Field::link("Orders", Relationship::OneMany, t1.clone(), fid('A')).with_id(fid('L')));
        let options = LookupOptions {
            link_field_id: fid('L'),
            foreign_table_id: t1,
            lookup_field_id: fid('A'),
        };
        customers
            .fields
            .push(Field::lookup("Amounts", options.clone()).with_id(fid('K')));
        customers
            .fields
            .push(Field::rollup("Total", options, RollupFunction::Sum).with_id(fid('R')));
        customers.fields.push(
            Field::new(
                "Double",
                FieldKind::Formula(FormulaOptions {
                    expression: format!("{{{}}} * 2", fid('R')),
                }),
            )
            .with_id(fid('F')),
        );
        schema.insert_table(orders);
        schema.insert_table(customers);

        assert_eq!(schema.shape_of(&fid('L')), Some(ValueShape::multiple(CellValueType::String)));
        assert_eq!(schema.shape_of(&fid('K')), Some(ValueShape::multiple(CellValueType::Number)));
        assert_eq!(schema.shape_of(&fid('R')), Some(ValueShape::scalar(CellValueType::Number)));
        assert_eq!(schema.shape_of(&fid('F')), Some(ValueShape::scalar(CellValueType::Number)));
    }
}
