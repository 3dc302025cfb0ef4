//! Row sources and aggregations for fields reading foreign records.
//!
//! Every link-based read (link display, lookup, rollup) has the same shape
//! thanks to the uniform key storage of [`LinkDbConfig`]:
//!
//! ```sql
//! SELECT j.<self_key> AS h, <value> AS v
//! FROM <fk_host> AS j JOIN <foreign> AS f ON f.__id = j.<foreign_key>
//! WHERE j.<foreign_key> IS NOT NULL
//! ```
//!
//! The source is either correlated to a host row (`AND j.<self_key> =
//! host.__id`) or grouped by `h` inside a CTE. The aggregation over `v`
//! is the same in both forms.

use cellflow_core::link::{AUTO_NUMBER_COLUMN, ID_COLUMN};
use cellflow_core::{Field, FieldKind, LinkDbConfig, RollupFunction, Schema};

use crate::dialect::{AggregateFn, DialectProvider};
use crate::error::SqlError;

/// Alias of the derived table the aggregation reads from.
pub const SOURCE_ALIAS: &str = "src";
/// Host-id column of a grouped source and of a link CTE.
pub const HOST_ID_COLUMN: &str = "__host_id";
/// Value column of a link CTE.
pub const VALUE_COLUMN: &str = "value";

/// How one foreign field's value is read per foreign row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSource {
    /// Per-row value expression.
    pub expr: String,
    /// FROM-clause item flattening a JSON column, if the field holds lists.
    pub each: Option<String>,
}

impl ValueSource {
    /// Reads `field`'s persisted column on rows aliased `alias`.
    ///
    /// Lists are flattened into one row per element; link cells contribute
    /// their titles.
    pub fn persisted(dialect: &dyn DialectProvider, schema: &Schema, field: &Field, alias: &str) -> Self {
        let column = dialect.column(alias, field.db_field_name());
        let each_alias = format!("je_{alias}");
        let multiple = schema.shape_of(&field.id).is_some_and(|s| s.is_multiple);
        match (&field.kind, multiple) {
            (FieldKind::Link(_), true) => ValueSource {
                expr: dialect.json_extract_title(&dialect.json_each_value(&each_alias)),
                each: Some(dialect.json_each_from(&column, &each_alias)),
            },
            (FieldKind::Link(_), false) => ValueSource {
                expr: dialect.json_extract_title(&column),
                each: None,
            },
            (_, true) => ValueSource {
                expr: dialect.json_each_value(&each_alias),
                each: Some(dialect.json_each_from(&column, &each_alias)),
            },
            (_, false) => ValueSource { expr: column, each: None },
        }
    }
}

/// What is computed over the selected foreign values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// `{id, title}` objects of the linked records.
    LinkDisplay { multiple: bool },
    /// The looked-up values themselves.
    Lookup { multiple: bool },
    Rollup(RollupFunction),
}

impl Aggregation {
    /// Whether list-valued sources are flattened before aggregating.
    pub fn flattens(self) -> bool {
        !matches!(
            self,
            Aggregation::LinkDisplay { .. } | Aggregation::Rollup(RollupFunction::CountAll)
        )
    }

    /// Whether an empty source aggregates to zero rather than null.
    pub fn zero_when_empty(self) -> bool {
        matches!(
            self,
            Aggregation::Rollup(
                RollupFunction::Count
                    | RollupFunction::CountAll
                    | RollupFunction::CountA
                    | RollupFunction::Sum
            )
        )
    }

    /// Renders the aggregate over the value column `v`.
    pub fn render(self, dialect: &dyn DialectProvider, v: &str) -> String {
        let truthy = format!("CASE WHEN {v} IS TRUE THEN 1 ELSE 0 END");
        match self {
            Aggregation::LinkDisplay { multiple: true } => {
                dialect.json_array_agg(&dialect.json_value(v), false)
            }
            Aggregation::LinkDisplay { multiple: false } => {
                dialect.aggregate(AggregateFn::Max, &dialect.to_text(v))
            }
            Aggregation::Lookup { multiple: true } => dialect.json_array_agg(v, true),
            Aggregation::Lookup { multiple: false } => dialect.aggregate(AggregateFn::Max, v),
            Aggregation::Rollup(func) => match func {
                RollupFunction::Count => dialect.aggregate(AggregateFn::Count, v),
                RollupFunction::CountAll => "COUNT(*)".to_string(),
                RollupFunction::CountA => dialect.aggregate(
                    AggregateFn::Count,
                    &format!("NULLIF({}, '')", dialect.to_text(v)),
                ),
                RollupFunction::Sum => {
                    dialect.coalesce_number(&dialect.aggregate(AggregateFn::Sum, v))
                }
                RollupFunction::Average => dialect.aggregate(AggregateFn::Avg, v),
                RollupFunction::Max => dialect.aggregate(AggregateFn::Max, v),
                RollupFunction::Min => dialect.aggregate(AggregateFn::Min, v),
                RollupFunction::And => dialect.aggregate(AggregateFn::Min, &truthy),
                RollupFunction::Or => dialect.aggregate(AggregateFn::Max, &truthy),
                RollupFunction::Xor => format!(
                    "({} % 2)",
                    dialect.aggregate(AggregateFn::Sum, &truthy)
                ),
                RollupFunction::ArrayJoin => dialect.string_agg(v, ", "),
                RollupFunction::Concatenate => dialect.string_agg(v, ""),
                RollupFunction::ArrayUnique => dialect.json_array_agg_distinct(v),
                RollupFunction::ArrayCompact => dialect.json_array_agg(v, true),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum HostFilter<'a> {
    All,
    Row(&'a str),
    Among(&'a str),
}

/// Foreign records reached through one link field.
#[derive(Debug, Clone)]
pub struct LinkedSource {
    db: LinkDbConfig,
    foreign_physical: String,
    join_alias: String,
    foreign_alias: String,
    value: ValueSource,
}

impl LinkedSource {
    /// Source of `link_field`, reading `value_field` on each linked record,
    /// or the link display object when `value_field` is `None`.
    pub fn new(
        dialect: &dyn DialectProvider,
        schema: &Schema,
        link_field: &Field,
        value_field: Option<&Field>,
        flatten: bool,
    ) -> Result<Self, SqlError> {
        let config = link_field.link_config().ok_or_else(|| {
            SqlError::Unsupported(format!("{} is not a link field", link_field.id))
        })?;
        let db = config
            .db_config()
            .ok_or_else(|| SqlError::LinkNotMaterialized {
                id: link_field.id.clone(),
            })?;
        let foreign = schema
            .table(&config.foreign_table_id)
            .ok_or_else(|| SqlError::MissingTable {
                id: config.foreign_table_id.clone(),
            })?;
        let suffix = link_field.id.as_str();
        let join_alias = format!("j_{suffix}");
        let foreign_alias = format!("f_{suffix}");

        let value = match value_field {
            Some(field) => {
                let mut value = ValueSource::persisted(dialect, schema, field, &foreign_alias);
                if !flatten {
                    value.each = None;
                    value.expr = dialect.column(&foreign_alias, field.db_field_name());
                }
                value
            }
            None => {
                let title = foreign.field(&config.lookup_field_id).ok_or_else(|| {
                    SqlError::MissingField {
                        id: config.lookup_field_id.clone(),
                    }
                })?;
                let title_expr = ValueSource::persisted(dialect, schema, title, &foreign_alias);
                let title_expr = if title_expr.each.is_some() {
                    dialect.column(&foreign_alias, title.db_field_name())
                } else {
                    title_expr.expr
                };
                ValueSource {
                    expr: dialect.json_object_link(
                        &dialect.column(&foreign_alias, ID_COLUMN),
                        &title_expr,
                    ),
                    each: None,
                }
            }
        };

        Ok(LinkedSource {
            db,
            foreign_physical: foreign.db_table_name().to_string(),
            join_alias,
            foreign_alias,
            value,
        })
    }

    fn rows(&self, dialect: &dyn DialectProvider, host: HostFilter<'_>) -> String {
        let self_key = dialect.column(&self.join_alias, &self.db.self_key_name);
        let foreign_key = dialect.column(&self.join_alias, &self.db.foreign_key_name);
        let mut sql = format!(
            "SELECT {self_key} AS \"h\", {value} AS \"v\" FROM {host} AS {j} JOIN {foreign} AS {f} ON {f_id} = {foreign_key}",
            value = self.value.expr,
            host = dialect.quote_ident(&self.db.fk_host_table_name),
            j = dialect.quote_ident(&self.join_alias),
            foreign = dialect.quote_ident(&self.foreign_physical),
            f = dialect.quote_ident(&self.foreign_alias),
            f_id = dialect.column(&self.foreign_alias, ID_COLUMN),
        );
        if let Some(each) = &self.value.each {
            sql.push_str(&format!(" CROSS JOIN {each}"));
        }
        sql.push_str(&format!(" WHERE {foreign_key} IS NOT NULL"));
        match host {
            HostFilter::All => {}
            HostFilter::Row(host_id) => sql.push_str(&format!(" AND {self_key} = {host_id}")),
            HostFilter::Among(ids) => sql.push_str(&format!(" AND {self_key} IN ({ids})")),
        }
        sql.push_str(&format!(
            " ORDER BY {}",
            dialect.column(&self.foreign_alias, AUTO_NUMBER_COLUMN)
        ));
        sql
    }

    /// Scalar sub-select aggregating the records linked to `host_id`.
    pub fn correlated(&self, dialect: &dyn DialectProvider, agg: Aggregation, host_id: &str) -> String {
        let v = dialect.column(SOURCE_ALIAS, "v");
        format!(
            "(SELECT {} FROM ({}) AS {})",
            agg.render(dialect, &v),
            self.rows(dialect, HostFilter::Row(host_id)),
            dialect.quote_ident(SOURCE_ALIAS)
        )
    }

    /// CTE body yielding one `(__host_id, value)` row per linked host record,
    /// optionally restricted to the host ids produced by the sub-select `hosts`.
    pub fn grouped(&self, dialect: &dyn DialectProvider, agg: Aggregation, hosts: Option<&str>) -> String {
        let v = dialect.column(SOURCE_ALIAS, "v");
        let h = dialect.column(SOURCE_ALIAS, "h");
        format!(
            "SELECT {h} AS {host}, {agg} AS {value} FROM ({rows}) AS {src} GROUP BY {h}",
            host = dialect.quote_ident(HOST_ID_COLUMN),
            agg = agg.render(dialect, &v),
            value = dialect.quote_ident(VALUE_COLUMN),
            rows = self.rows(dialect, hosts.map_or(HostFilter::All, HostFilter::Among)),
            src = dialect.quote_ident(SOURCE_ALIAS),
        )
    }
}

/// Resolves the link source and aggregation of a link, lookup or rollup.
///
/// Returns `Ok(None)` for any other field kind.
pub fn linked_read(
    dialect: &dyn DialectProvider,
    schema: &Schema,
    field: &Field,
) -> Result<Option<(LinkedSource, Aggregation)>, SqlError> {
    let multiple = schema.shape_of(&field.id).is_some_and(|s| s.is_multiple);
    let (link_id, value_id, agg) = match &field.kind {
        FieldKind::Link(_) => {
            let agg = Aggregation::LinkDisplay { multiple };
            return Ok(Some((LinkedSource::new(dialect, schema, field, None, false)?, agg)));
        }
        FieldKind::Lookup(options) => (
            &options.link_field_id,
            &options.lookup_field_id,
            Aggregation::Lookup { multiple },
        ),
        FieldKind::Rollup(cfg) => (
            &cfg.options.link_field_id,
            &cfg.options.lookup_field_id,
            Aggregation::Rollup(cfg.expression),
        ),
        _ => return Ok(None),
    };
    let link = schema
        .field(link_id)
        .ok_or_else(|| SqlError::MissingField { id: link_id.clone() })?;
    let value = schema
        .field(value_id)
        .ok_or_else(|| SqlError::MissingField { id: value_id.clone() })?;
    let source = LinkedSource::new(dialect, schema, link, Some(value), agg.flattens())?;
    Ok(Some((source, agg)))
}
