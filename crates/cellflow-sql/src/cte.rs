//! Grouped CTEs for link-based fields.

use cellflow_core::link::ID_COLUMN;
use cellflow_core::{Field, Schema};

use crate::dialect::DialectProvider;
use crate::error::SqlError;
use crate::source::{linked_read, HOST_ID_COLUMN};
use crate::state::QueryBuilderStateMut;

/// Registers one `(__host_id, value)` CTE per link, lookup or rollup field.
pub struct LinkCteBuilder<'a> {
    schema: &'a Schema,
    dialect: &'a dyn DialectProvider,
}

impl<'a> LinkCteBuilder<'a> {
    pub fn new(schema: &'a Schema, dialect: &'a dyn DialectProvider) -> Self {
        LinkCteBuilder { schema, dialect }
    }

    /// Registers the CTE computing `field` and returns its name, or `None`
    /// when the field does not read linked records.
    ///
    /// When the state carries a base CTE the grouped rows are restricted to
    /// the host ids it selects.
    pub fn register<S: QueryBuilderStateMut + ?Sized>(
        &self,
        state: &mut S,
        field: &Field,
    ) -> Result<Option<String>, SqlError> {
        let Some((source, agg)) = linked_read(self.dialect, self.schema, field)? else {
            return Ok(None);
        };
        let hosts = state.base_cte().map(|base| {
            format!(
                "SELECT {} FROM {}",
                self.dialect.quote_ident(ID_COLUMN),
                self.dialect.quote_ident(base)
            )
        });
        let body = source.grouped(self.dialect, agg, hosts.as_deref());
        Ok(Some(state.register_cte(field.id.clone(), field.id.as_str(), body)))
    }

    /// `LEFT JOIN "<cte>" ON "<cte>"."__host_id" = "<alias>"."__id"`.
    pub fn join_clause(&self, cte: &str, alias: &str) -> String {
        format!(
            "LEFT JOIN {} ON {} = {}",
            self.dialect.quote_ident(cte),
            self.dialect.column(cte, HOST_ID_COLUMN),
            self.dialect.column(alias, ID_COLUMN)
        )
    }
}
