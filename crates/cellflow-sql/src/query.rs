//! Record queries: one row per record, one column per requested field.
//!
//! The query selects computed fields *fresh* from the database, which is
//! what the recompute pipeline compares against persisted values.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cellflow_core::formula::Formula;
use cellflow_core::link::{AUTO_NUMBER_COLUMN, ID_COLUMN};
use cellflow_core::{FieldId, FieldKind, RecordId, Schema, TableId};

use crate::compiler::FieldSelectCompiler;
use crate::cte::LinkCteBuilder;
use crate::dialect::DialectProvider;
use crate::error::SqlError;
use crate::state::{MainTable, QueryBuilderStateMut, QueryStateManager};

/// Alias of the main table in every record query.
pub const MAIN_ALIAS: &str = "t";
/// Name of the base CTE restricting the main table to requested records.
pub const BASE_CTE: &str = "base";

/// How link-based fields are brought into a record query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CteStrategy {
    /// Grouped CTEs joined to the main table.
    #[default]
    Join,
    /// Correlated sub-selects per row, no CTEs.
    Correlated,
}

impl fmt::Display for CteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CteStrategy::Join => "join",
            CteStrategy::Correlated => "correlated",
        })
    }
}

impl FromStr for CteStrategy {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "join" => Ok(CteStrategy::Join),
            "correlated" => Ok(CteStrategy::Correlated),
            other => Err(SqlError::Unsupported(format!("unknown CTE strategy '{other}'"))),
        }
    }
}

/// A compiled record query ready to execute.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    /// Positional parameters, bound in order.
    pub params: Vec<String>,
    /// Field ids of the selected columns after `__id`, in order.
    pub columns: Vec<FieldId>,
    /// Fields that failed to compile and were selected as NULL.
    pub failed: Vec<(FieldId, SqlError)>,
}

pub struct RecordQueryBuilder<'a> {
    schema: &'a Schema,
    dialect: &'a dyn DialectProvider,
    table_id: TableId,
    strategy: CteStrategy,
}

impl<'a> RecordQueryBuilder<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a dyn DialectProvider, table_id: TableId) -> Self {
        RecordQueryBuilder {
            schema,
            dialect,
            table_id,
            strategy: CteStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: CteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Compiles a query selecting `fields` for `records` (all records when
    /// `None`), ordered by auto number.
    ///
    /// A field that fails to compile does not fail the query: it is
    /// selected as NULL and reported in [`CompiledQuery::failed`].
    pub fn build(&self, fields: &[FieldId], records: Option<&[RecordId]>) -> Result<CompiledQuery, SqlError> {
        let d = self.dialect;
        let table = self
            .schema
            .table(&self.table_id)
            .ok_or_else(|| SqlError::MissingTable {
                id: self.table_id.clone(),
            })?;

        let mut state = QueryStateManager::new();
        state.set_main_table(MainTable {
            alias: MAIN_ALIAS.to_string(),
            physical_name: table.db_table_name().to_string(),
        })?;

        let mut params = Vec::new();
        let mut base = None;
        if let Some(records) = records {
            let placeholders: Vec<String> = (1..=records.len()).map(|n| d.placeholder(n)).collect();
            params.extend(records.iter().map(|r| r.to_string()));
            let body = if records.is_empty() {
                format!(
                    "SELECT * FROM {} WHERE {}",
                    d.quote_ident(table.db_table_name()),
                    d.bool_literal(false)
                )
            } else {
                format!(
                    "SELECT * FROM {} WHERE {} IN ({})",
                    d.quote_ident(table.db_table_name()),
                    d.quote_ident(ID_COLUMN),
                    placeholders.join(", ")
                )
            };
            state.set_base_cte(BASE_CTE.to_string());
            base = Some(body);
        }

        let ctes = LinkCteBuilder::new(self.schema, d);
        if self.strategy == CteStrategy::Join {
            for field_id in self.cte_candidates(fields) {
                let Some(field) = table.field(&field_id) else { continue };
                match ctes.register(&mut state, field) {
                    Ok(Some(name)) => state.mark_cte_joined(&name),
                    Ok(None) => {}
                    // Compiling the field reports the same error below.
                    Err(err) => debug!(field = %field_id, error = %err, "no CTE for field"),
                }
            }
        }

        let mut selections = Vec::with_capacity(fields.len());
        let mut failed = Vec::new();
        {
            let mut compiler =
                FieldSelectCompiler::new(self.schema, d, &mut state, self.table_id.clone(), MAIN_ALIAS);
            for field_id in fields {
                match compiler.compile(field_id) {
                    Ok(sql) => selections.push(sql),
                    Err(err) => {
                        warn!(table = %self.table_id, field = %field_id, error = %err, "field selection failed to compile");
                        selections.push("NULL".to_string());
                        failed.push((field_id.clone(), err));
                    }
                }
            }
        }

        let mut with = Vec::new();
        if let Some(body) = &base {
            with.push(format!("{} AS ({body})", d.quote_ident(BASE_CTE)));
        }
        let mut joins = Vec::new();
        for cte in state.joined_ctes() {
            with.push(format!("{} AS ({})", d.quote_ident(&cte.name), cte.body));
            joins.push(ctes.join_clause(&cte.name, MAIN_ALIAS));
        }

        let mut sql = String::new();
        if !with.is_empty() {
            sql.push_str("WITH ");
            sql.push_str(&with.join(", "));
            sql.push(' ');
        }
        let mut columns = vec![format!(
            "{} AS {}",
            d.column(MAIN_ALIAS, ID_COLUMN),
            d.quote_ident(ID_COLUMN)
        )];
        for (field_id, selection) in fields.iter().zip(&selections) {
            columns.push(format!("{selection} AS {}", d.quote_ident(field_id.as_str())));
        }
        let from = if base.is_some() {
            BASE_CTE
        } else {
            table.db_table_name()
        };
        sql.push_str(&format!(
            "SELECT {} FROM {} AS {}",
            columns.join(", "),
            d.quote_ident(from),
            d.quote_ident(MAIN_ALIAS)
        ));
        for join in joins {
            sql.push(' ');
            sql.push_str(&join);
        }
        sql.push_str(&format!(
            " ORDER BY {}",
            d.column(MAIN_ALIAS, AUTO_NUMBER_COLUMN)
        ));

        Ok(CompiledQuery {
            sql,
            params,
            columns: fields.to_vec(),
            failed,
        })
    }

    /// Link-based fields among `fields` and the same-table fields their
    /// formulas read, transitively.
    fn cte_candidates(&self, fields: &[FieldId]) -> IndexSet<FieldId> {
        let mut seen: IndexSet<FieldId> = IndexSet::new();
        let mut out = IndexSet::new();
        let mut stack: Vec<FieldId> = fields.iter().rev().cloned().collect();
        let Some(table) = self.schema.table(&self.table_id) else {
            return out;
        };
        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let Some(field) = table.field(&id) else { continue };
            match &field.kind {
                FieldKind::Link(_) | FieldKind::Lookup(_) | FieldKind::Rollup(_) => {
                    out.insert(id);
                }
                FieldKind::Formula(options) => {
                    if let Ok(formula) = Formula::parse(&options.expression) {
                        stack.extend(formula.references().into_iter().rev());
                    }
                }
                _ => {}
            }
        }
        out
    }
}
