//! The field visitor: one method per field variant.
//!
//! Every concern that differs per variant (SQL compilation, value-shape
//! inference, dependency extraction, create/delete side effects) is a
//! separate [`FieldVisitor`] implementation. [`Field::accept`] dispatches
//! with an exhaustive `match`, so adding a variant fails to compile until
//! every visitor handles it.

use crate::field::{Field, FieldKind, FormulaOptions};
use crate::link::LinkFieldConfig;
use crate::lookup::{ConditionalRollupConfig, LookupOptions, RollupFieldConfig};

pub trait FieldVisitor {
    type Output;

    fn visit_single_line_text(&mut self, field: &Field) -> Self::Output;
    fn visit_long_text(&mut self, field: &Field) -> Self::Output;
    fn visit_number(&mut self, field: &Field, precision: u8) -> Self::Output;
    fn visit_checkbox(&mut self, field: &Field) -> Self::Output;
    fn visit_single_select(&mut self, field: &Field, choices: &[String]) -> Self::Output;
    fn visit_date(&mut self, field: &Field) -> Self::Output;
    fn visit_link(&mut self, field: &Field, config: &LinkFieldConfig) -> Self::Output;
    fn visit_formula(&mut self, field: &Field, options: &FormulaOptions) -> Self::Output;
    fn visit_lookup(&mut self, field: &Field, options: &LookupOptions) -> Self::Output;
    fn visit_rollup(&mut self, field: &Field, config: &RollupFieldConfig) -> Self::Output;
    fn visit_conditional_rollup(
        &mut self,
        field: &Field,
        config: &ConditionalRollupConfig,
    ) -> Self::Output;
}

impl Field {
    /// Dispatches to the visitor method for this field's variant.
    pub fn accept<V: FieldVisitor + ?Sized>(&self, visitor: &mut V) -> V::Output {
        match &self.kind {
            FieldKind::SingleLineText => visitor.visit_single_line_text(self),
            FieldKind::LongText => visitor.visit_long_text(self),
            FieldKind::Number { precision } => visitor.visit_number(self, *precision),
            FieldKind::Checkbox => visitor.visit_checkbox(self),
            FieldKind::SingleSelect { choices } => visitor.visit_single_select(self, choices),
            FieldKind::Date => visitor.visit_date(self),
            FieldKind::Link(config) => visitor.visit_link(self, config),
            FieldKind::Formula(options) => visitor.visit_formula(self, options),
            FieldKind::Lookup(options) => visitor.visit_lookup(self, options),
            FieldKind::Rollup(config) => visitor.visit_rollup(self, config),
            FieldKind::ConditionalRollup(config) => visitor.visit_conditional_rollup(self, config),
        }
    }
}
