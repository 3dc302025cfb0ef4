//! Field selection compiler.
//!
//! [`FieldSelectCompiler`] is a [`FieldVisitor`] turning one field of one
//! table into a SQL expression over the rows aliased `alias`. Selections are
//! memoized in the query-builder state, so a formula referencing a rollup
//! twice compiles the rollup once.
//!
//! Link-based fields resolve in order:
//!
//! 1. a CTE registered for the field and joined into this query: read its
//!    `value` column;
//! 2. a CTE registered but not joined here: read the field's persisted
//!    column on the current row;
//! 3. no CTE: a correlated sub-select over the linked records.
//!
//! Conditional rollups always compile to a correlated sub-select; their
//! filter is compiled by a nested compiler over a [`ScopedSelectionState`].

use std::collections::HashMap;

use cellflow_core::condition::{Conjunction, DateValue, FilterGroup, FilterItem, FilterLeaf};
use cellflow_core::formula::{BinaryOp, Expr, Function, UnaryOp};
use cellflow_core::link::{AUTO_NUMBER_COLUMN, ID_COLUMN};
use cellflow_core::lookup::ConditionalRollupConfig;
use cellflow_core::{
    CellValue, CoreError, Field, FieldId, FieldKind, FieldVisitor, FilterOperator,
    FilterValue, FormulaOptions, LinkFieldConfig, LookupOptions, RollupFieldConfig, Schema,
    TableId,
};

use crate::dialect::{number_literal, DialectProvider};
use crate::error::SqlError;
use crate::source::{linked_read, Aggregation, ValueSource, SOURCE_ALIAS, VALUE_COLUMN};
use crate::state::{QueryBuilderStateMut, ScopedSelectionState};

/// Nesting bound for formula and filter compilation.
const MAX_DEPTH: usize = 64;

pub struct FieldSelectCompiler<'a, S: QueryBuilderStateMut> {
    schema: &'a Schema,
    dialect: &'a dyn DialectProvider,
    state: &'a mut S,
    table_id: TableId,
    alias: String,
    depth: usize,
}

impl<'a, S: QueryBuilderStateMut> FieldSelectCompiler<'a, S> {
    /// Compiler for fields of `table_id`, whose rows are aliased `alias`.
    pub fn new(
        schema: &'a Schema,
        dialect: &'a dyn DialectProvider,
        state: &'a mut S,
        table_id: TableId,
        alias: impl Into<String>,
    ) -> Self {
        FieldSelectCompiler {
            schema,
            dialect,
            state,
            table_id,
            alias: alias.into(),
            depth: 0,
        }
    }

    /// Compiles `field_id`, reusing a memoized selection when present.
    pub fn compile(&mut self, field_id: &FieldId) -> Result<String, SqlError> {
        if let Some(sql) = self.state.selection(field_id) {
            return Ok(sql.to_string());
        }
        let schema = self.schema;
        let field = schema
            .table(&self.table_id)
            .and_then(|t| t.field(field_id))
            .ok_or_else(|| SqlError::MissingField { id: field_id.clone() })?;
        if field.has_error {
            return Err(SqlError::Unsupported(format!("field {field_id} is marked as errored")));
        }

        self.enter()?;
        let result = field.accept(self);
        self.depth -= 1;
        let sql = result?;
        self.state.set_selection(field_id.clone(), sql.clone());
        Ok(sql)
    }

    fn enter(&mut self) -> Result<(), SqlError> {
        if self.depth >= MAX_DEPTH {
            return Err(SqlError::Unsupported(format!(
                "expression nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn column(&self, field: &Field) -> String {
        self.dialect.column(&self.alias, field.db_field_name())
    }

    fn host_id(&self) -> String {
        self.dialect.column(&self.alias, ID_COLUMN)
    }

    // -----------------------------------------------------------------------
    // Link, lookup, rollup
    // -----------------------------------------------------------------------

    fn linked(&mut self, field: &Field) -> Result<String, SqlError> {
        let (source, agg) = linked_read(self.dialect, self.schema, field)?.ok_or_else(|| {
            SqlError::Unsupported(format!("{} does not read linked records", field.id))
        })?;
        match self.state.cte_for_field(&field.id) {
            Some(cte) if self.state.is_cte_joined(cte) => {
                let value = self.dialect.column(cte, VALUE_COLUMN);
                Ok(if agg.zero_when_empty() {
                    self.dialect.coalesce_number(&value)
                } else {
                    value
                })
            }
            Some(_) => Ok(self.column(field)),
            None => Ok(source.correlated(self.dialect, agg, &self.host_id())),
        }
    }

    // -----------------------------------------------------------------------
    // Conditional rollup
    // -----------------------------------------------------------------------

    fn conditional(&mut self, field: &Field, config: &ConditionalRollupConfig) -> Result<String, SqlError> {
        let options = &config.options;
        let schema = self.schema;
        let dialect = self.dialect;
        let foreign = schema
            .table(&options.foreign_table_id)
            .ok_or_else(|| SqlError::MissingTable {
                id: options.foreign_table_id.clone(),
            })?;
        let value_field = foreign
            .field(&options.lookup_field_id)
            .ok_or_else(|| SqlError::MissingField {
                id: options.lookup_field_id.clone(),
            })?;

        // Host references resolve against the current row before the scope opens.
        let mut host_refs = HashMap::new();
        for id in options.condition.referenced_host_fields() {
            let sql = self.compile(&id)?;
            host_refs.insert(id, sql);
        }

        let alias = format!("cr_{}", field.id);
        let agg = Aggregation::Rollup(config.expression);
        let mut value = ValueSource::persisted(dialect, schema, value_field, &alias);
        if !agg.flattens() {
            value = ValueSource {
                expr: dialect.column(&alias, value_field.db_field_name()),
                each: None,
            };
        }

        let (filter, order) = {
            let mut scoped = ScopedSelectionState::new(&*self.state);
            let mut inner =
                FieldSelectCompiler::new(schema, dialect, &mut scoped, foreign.id.clone(), alias.clone());
            inner.depth = self.depth;
            let filter = match &options.condition.filter {
                Some(group) => inner.filter_group(group, &host_refs)?,
                None => dialect.bool_literal(true),
            };
            let tiebreak = dialect.column(&alias, AUTO_NUMBER_COLUMN);
            let order = match &options.condition.sort {
                Some(sort) => format!(
                    "{} {}, {tiebreak}",
                    inner.compile(&sort.field_id)?,
                    if sort.descending { "DESC" } else { "ASC" }
                ),
                None => tiebreak,
            };
            (filter, order)
        };

        let q_alias = dialect.quote_ident(&alias);
        let mut selected = format!(
            "SELECT * FROM {} AS {q_alias} WHERE {filter} ORDER BY {order}",
            dialect.quote_ident(foreign.db_table_name())
        );
        if let Some(limit) = options.condition.limit {
            selected.push_str(&format!(" LIMIT {limit}"));
        }
        let mut rows = format!("SELECT {} AS \"v\" FROM ({selected}) AS {q_alias}", value.expr);
        if let Some(each) = &value.each {
            rows.push_str(&format!(" CROSS JOIN {each}"));
        }
        Ok(format!(
            "(SELECT {} FROM ({rows}) AS {})",
            agg.render(dialect, &dialect.column(SOURCE_ALIAS, "v")),
            dialect.quote_ident(SOURCE_ALIAS)
        ))
    }

    fn filter_group(
        &mut self,
        group: &FilterGroup,
        host_refs: &HashMap<FieldId, String>,
    ) -> Result<String, SqlError> {
        if group.items.is_empty() {
            return Ok(self.dialect.bool_literal(true));
        }
        self.enter()?;
        let parts = group
            .items
            .iter()
            .map(|item| match item {
                FilterItem::Group(inner) => self.filter_group(inner, host_refs),
                FilterItem::Leaf(leaf) => self.filter_leaf(leaf, host_refs),
            })
            .collect::<Result<Vec<_>, _>>();
        self.depth -= 1;
        let joiner = match group.conjunction {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        };
        Ok(format!("({})", parts?.join(joiner)))
    }

    fn filter_leaf(&mut self, leaf: &FilterLeaf, host_refs: &HashMap<FieldId, String>) -> Result<String, SqlError> {
        let schema = self.schema;
        let d = self.dialect;
        let field = schema
            .table(&self.table_id)
            .and_then(|t| t.field(&leaf.field_id))
            .ok_or_else(|| SqlError::MissingField {
                id: leaf.field_id.clone(),
            })?;
        let shape = schema
            .shape_of(&field.id)
            .ok_or_else(|| SqlError::MissingField { id: field.id.clone() })?;
        let column = self.compile(&leaf.field_id)?;

        let list = match &leaf.value {
            FilterValue::List(items) => items.iter().map(|v| self.literal(v)).collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };
        let is_date_operand = matches!(leaf.value, FilterValue::Date(_));
        let rhs = match &leaf.value {
            FilterValue::None | FilterValue::List(_) => String::new(),
            FilterValue::Literal(v) => self.literal(v)?,
            FilterValue::Date(DateValue::Exact(iso)) => d.date_literal(iso),
            FilterValue::Date(date) => d.relative_date(date.day_offset().unwrap_or(0)),
            FilterValue::FieldRef(id) => host_refs
                .get(id)
                .cloned()
                .ok_or_else(|| SqlError::MissingField { id: id.clone() })?,
        };

        if shape.is_json() {
            return json_leaf(d, leaf.operator, &column, &rhs, &list);
        }

        let lhs = if matches!(field.kind, FieldKind::Link(_)) {
            d.json_extract_title(&column)
        } else if is_date_operand {
            d.to_date(&column)
        } else {
            column
        };
        let sql = match leaf.operator {
            FilterOperator::Is => format!("({lhs} = {rhs})"),
            FilterOperator::IsNot => format!("({lhs} IS NULL OR {lhs} <> {rhs})"),
            FilterOperator::Contains => d.contains_text(&lhs, &rhs),
            FilterOperator::DoesNotContain => {
                format!("({lhs} IS NULL OR NOT {})", d.contains_text(&lhs, &rhs))
            }
            FilterOperator::IsGreater => format!("({lhs} > {rhs})"),
            FilterOperator::IsGreaterEqual => format!("({lhs} >= {rhs})"),
            FilterOperator::IsLess => format!("({lhs} < {rhs})"),
            FilterOperator::IsLessEqual => format!("({lhs} <= {rhs})"),
            FilterOperator::IsEmpty => format!("({lhs} IS NULL OR {} = '')", d.to_text(&lhs)),
            FilterOperator::IsNotEmpty => {
                format!("({lhs} IS NOT NULL AND {} <> '')", d.to_text(&lhs))
            }
            FilterOperator::IsAnyOf if list.is_empty() => d.bool_literal(false),
            FilterOperator::IsAnyOf => format!("({lhs} IN ({}))", list.join(", ")),
            FilterOperator::IsNoneOf if list.is_empty() => d.bool_literal(true),
            FilterOperator::IsNoneOf => {
                format!("({lhs} IS NULL OR {lhs} NOT IN ({}))", list.join(", "))
            }
        };
        Ok(sql)
    }

    // -----------------------------------------------------------------------
    // Formulas
    // -----------------------------------------------------------------------

    fn literal(&self, value: &CellValue) -> Result<String, SqlError> {
        match value {
            CellValue::Null => Ok("NULL".to_string()),
            CellValue::Bool(b) => Ok(self.dialect.bool_literal(*b)),
            CellValue::Number(n) => Ok(number_literal(*n)),
            CellValue::Text(s) => Ok(self.dialect.quote_literal(s)),
            CellValue::Link { .. } | CellValue::List(_) => Err(SqlError::Unsupported(format!(
                "no SQL literal for {value:?}"
            ))),
        }
    }

    fn text_operand(&self, expr: &str) -> String {
        format!("COALESCE({}, '')", self.dialect.to_text(expr))
    }

    fn expr(&mut self, expr: &Expr) -> Result<String, SqlError> {
        self.enter()?;
        let sql = self.expr_inner(expr);
        self.depth -= 1;
        sql
    }

    fn expr_inner(&mut self, expr: &Expr) -> Result<String, SqlError> {
        match expr {
            Expr::Literal(value) => self.literal(value),
            Expr::Field(id) => self.compile(id),
            Expr::Unary { op: UnaryOp::Neg, expr } => Ok(format!("(-{})", self.expr(expr)?)),
            Expr::Binary { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                Ok(match op {
                    BinaryOp::Concat => {
                        format!("({} || {})", self.text_operand(&l), self.text_operand(&r))
                    }
                    BinaryOp::Div => format!("({l} / NULLIF({r}, 0))"),
                    BinaryOp::Mod => self.dialect.modulo(&l, &r),
                    BinaryOp::NotEq => format!("({l} <> {r})"),
                    op => format!("({l} {} {r})", op.symbol()),
                })
            }
            Expr::Call { function, args } => self.call(*function, args),
        }
    }

    fn call(&mut self, function: Function, args: &[Expr]) -> Result<String, SqlError> {
        let args = args
            .iter()
            .map(|a| self.expr(a))
            .collect::<Result<Vec<_>, _>>()?;
        let arg = |i: usize| {
            args.get(i).cloned().ok_or_else(|| {
                SqlError::Unsupported(format!("{} is missing argument {}", function.name(), i + 1))
            })
        };
        let sql = match function {
            Function::If => format!(
                "(CASE WHEN {} THEN {} ELSE {} END)",
                arg(0)?,
                arg(1)?,
                args.get(2).cloned().unwrap_or_else(|| "NULL".to_string())
            ),
            Function::Round => format!(
                "ROUND({}, {})",
                arg(0)?,
                args.get(1).cloned().unwrap_or_else(|| "0".to_string())
            ),
            Function::Abs => format!("ABS({})", arg(0)?),
            Function::Concatenate if args.is_empty() => "''".to_string(),
            Function::Concatenate => format!(
                "({})",
                args.iter()
                    .map(|a| self.text_operand(a))
                    .collect::<Vec<_>>()
                    .join(" || ")
            ),
            Function::Upper => format!("UPPER({})", arg(0)?),
            Function::Lower => format!("LOWER({})", arg(0)?),
            Function::Len => self.dialect.length(&self.dialect.to_text(&arg(0)?)),
            Function::And => format!("({})", args.join(" AND ")),
            Function::Or => format!("({})", args.join(" OR ")),
            Function::Not => format!("(NOT {})", arg(0)?),
            Function::Blank => "NULL".to_string(),
        };
        Ok(sql)
    }
}

/// Filter leaf over a JSON list column.
fn json_leaf(
    d: &dyn DialectProvider,
    operator: FilterOperator,
    column: &str,
    rhs: &str,
    list: &[String],
) -> Result<String, SqlError> {
    let any_of = |items: &[String]| {
        if items.is_empty() {
            d.bool_literal(false)
        } else {
            let parts: Vec<String> = items.iter().map(|v| d.json_array_contains(column, v)).collect();
            format!("({})", parts.join(" OR "))
        }
    };
    let sql = match operator {
        FilterOperator::Is | FilterOperator::Contains => d.json_array_contains(column, rhs),
        FilterOperator::IsNot | FilterOperator::DoesNotContain => format!(
            "({column} IS NULL OR NOT {})",
            d.json_array_contains(column, rhs)
        ),
        FilterOperator::IsEmpty => format!("({column} IS NULL OR {column} = '[]')"),
        FilterOperator::IsNotEmpty => format!("({column} IS NOT NULL AND {column} <> '[]')"),
        FilterOperator::IsAnyOf => any_of(list),
        FilterOperator::IsNoneOf => format!("({column} IS NULL OR NOT {})", any_of(list)),
        op => {
            return Err(SqlError::Unsupported(format!(
                "operator {op:?} does not apply to list values"
            )))
        }
    };
    Ok(sql)
}

impl<S: QueryBuilderStateMut> FieldVisitor for FieldSelectCompiler<'_, S> {
    type Output = Result<String, SqlError>;

    fn visit_single_line_text(&mut self, field: &Field) -> Self::Output {
        Ok(self.column(field))
    }

    fn visit_long_text(&mut self, field: &Field) -> Self::Output {
        Ok(self.column(field))
    }

    fn visit_number(&mut self, field: &Field, _precision: u8) -> Self::Output {
        Ok(self.column(field))
    }

    fn visit_checkbox(&mut self, field: &Field) -> Self::Output {
        Ok(self.column(field))
    }

    fn visit_single_select(&mut self, field: &Field, _choices: &[String]) -> Self::Output {
        Ok(self.column(field))
    }

    fn visit_date(&mut self, field: &Field) -> Self::Output {
        Ok(self.column(field))
    }

    fn visit_link(&mut self, field: &Field, _config: &LinkFieldConfig) -> Self::Output {
        self.linked(field)
    }

    fn visit_formula(&mut self, _field: &Field, options: &FormulaOptions) -> Self::Output {
        let formula = cellflow_core::Formula::parse(&options.expression).map_err(CoreError::from)?;
        self.expr(formula.root())
    }

    fn visit_lookup(&mut self, field: &Field, _options: &LookupOptions) -> Self::Output {
        self.linked(field)
    }

    fn visit_rollup(&mut self, field: &Field, _config: &RollupFieldConfig) -> Self::Output {
        self.linked(field)
    }

    fn visit_conditional_rollup(
        &mut self,
        field: &Field,
        config: &ConditionalRollupConfig,
    ) -> Self::Output {
        self.conditional(field, config)
    }
}
