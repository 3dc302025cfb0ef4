//! Dialect providers: the thin seam between the compiler and a concrete
//! SQL backend.
//!
//! The compiler is dialect-agnostic; everything that differs between
//! backends (quoting, JSON aggregation, date arithmetic, boolean literals)
//! is rendered here. [`SqliteDialect`] is the executed backend;
//! [`PostgresDialect`] renders only.

use std::fmt;

/// Plain aggregate functions with a portable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    pub fn sql_name(self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }
}

/// Renders a finite number as a SQL literal that is never an integer
/// literal, so `/` never truncates.
pub fn number_literal(n: f64) -> String {
    if n.is_finite() {
        format!("{n:?}")
    } else {
        "NULL".to_string()
    }
}

pub trait DialectProvider: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// `"alias"."column"`.
    fn column(&self, alias: &str, column: &str) -> String {
        format!("{}.{}", self.quote_ident(alias), self.quote_ident(column))
    }

    fn bool_literal(&self, value: bool) -> String;

    /// Positional bind parameter `n` (1-based).
    fn placeholder(&self, n: usize) -> String;

    fn aggregate(&self, func: AggregateFn, expr: &str) -> String {
        format!("{}({expr})", func.sql_name())
    }

    fn coalesce_number(&self, expr: &str) -> String {
        format!("COALESCE({expr}, 0)")
    }

    fn to_text(&self, expr: &str) -> String;

    /// Truncated remainder with a null result for a zero divisor.
    fn modulo(&self, left: &str, right: &str) -> String;

    fn length(&self, expr: &str) -> String;

    /// Aggregates values into a JSON array, skipping nulls when asked.
    fn json_array_agg(&self, expr: &str, skip_nulls: bool) -> String;

    fn json_array_agg_distinct(&self, expr: &str) -> String;

    /// Re-parses JSON text so aggregation embeds it as an object.
    fn json_value(&self, expr: &str) -> String;

    /// `{"id": <id>, "title": <title>}`.
    fn json_object_link(&self, id_expr: &str, title_expr: &str) -> String;

    /// `$.title` of a JSON link object.
    fn json_extract_title(&self, json_expr: &str) -> String;

    /// A FROM-clause item expanding a JSON array into one row per element.
    fn json_each_from(&self, json_expr: &str, alias: &str) -> String;

    /// The element value column of [`DialectProvider::json_each_from`].
    fn json_each_value(&self, alias: &str) -> String;

    /// Whether a JSON array contains an element equal to `value_expr`.
    fn json_array_contains(&self, json_expr: &str, value_expr: &str) -> String;

    fn string_agg(&self, expr: &str, separator: &str) -> String;

    /// Case-insensitive substring test.
    fn contains_text(&self, haystack: &str, needle: &str) -> String;

    /// Today shifted by `offset_days`, as an ISO date.
    fn relative_date(&self, offset_days: i64) -> String;

    fn date_literal(&self, iso: &str) -> String;

    /// Truncates a stored date or datetime to its calendar date.
    fn to_date(&self, expr: &str) -> String;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl DialectProvider for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn bool_literal(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    fn placeholder(&self, n: usize) -> String {
        format!("?{n}")
    }

    fn to_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }

    fn modulo(&self, left: &str, right: &str) -> String {
        format!("({left} - NULLIF({right}, 0) * CAST({left} / NULLIF({right}, 0) AS INTEGER))")
    }

    fn length(&self, expr: &str) -> String {
        format!("LENGTH({expr})")
    }

    fn json_array_agg(&self, expr: &str, skip_nulls: bool) -> String {
        if skip_nulls {
            format!("json_group_array({expr}) FILTER (WHERE {expr} IS NOT NULL)")
        } else {
            format!("json_group_array({expr})")
        }
    }

    fn json_array_agg_distinct(&self, expr: &str) -> String {
        format!("json_group_array(DISTINCT {expr}) FILTER (WHERE {expr} IS NOT NULL)")
    }

    fn json_value(&self, expr: &str) -> String {
        format!("json({expr})")
    }

    fn json_object_link(&self, id_expr: &str, title_expr: &str) -> String {
        format!("json_object('id', {id_expr}, 'title', {title_expr})")
    }

    fn json_extract_title(&self, json_expr: &str) -> String {
        format!("json_extract({json_expr}, '$.title')")
    }

    fn json_each_from(&self, json_expr: &str, alias: &str) -> String {
        format!("json_each({json_expr}) AS {}", self.quote_ident(alias))
    }

    fn json_each_value(&self, alias: &str) -> String {
        self.column(alias, "value")
    }

    fn json_array_contains(&self, json_expr: &str, value_expr: &str) -> String {
        format!(
            "EXISTS (SELECT 1 FROM json_each({json_expr}) AS \"je_c\" WHERE \
             (CASE WHEN \"je_c\".\"type\" = 'object' THEN json_extract(\"je_c\".\"value\", '$.title') \
             ELSE \"je_c\".\"value\" END) = {value_expr})"
        )
    }

    fn string_agg(&self, expr: &str, separator: &str) -> String {
        format!("group_concat({expr}, {})", self.quote_literal(separator))
    }

    fn contains_text(&self, haystack: &str, needle: &str) -> String {
        format!("(instr(lower({haystack}), lower({needle})) > 0)")
    }

    fn relative_date(&self, offset_days: i64) -> String {
        format!("date('now', '{offset_days:+} days')")
    }

    fn date_literal(&self, iso: &str) -> String {
        format!("date({})", self.quote_literal(iso))
    }

    fn to_date(&self, expr: &str) -> String {
        format!("date({expr})")
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL (rendering only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl DialectProvider for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn bool_literal(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_string()
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn to_text(&self, expr: &str) -> String {
        format!("({expr})::text")
    }

    fn modulo(&self, left: &str, right: &str) -> String {
        format!("MOD({left}, NULLIF({right}, 0))")
    }

    fn length(&self, expr: &str) -> String {
        format!("char_length({expr})")
    }

    fn json_array_agg(&self, expr: &str, skip_nulls: bool) -> String {
        if skip_nulls {
            format!("jsonb_agg({expr}) FILTER (WHERE {expr} IS NOT NULL)")
        } else {
            format!("jsonb_agg({expr})")
        }
    }

    fn json_array_agg_distinct(&self, expr: &str) -> String {
        format!("jsonb_agg(DISTINCT {expr}) FILTER (WHERE {expr} IS NOT NULL)")
    }

    fn json_value(&self, expr: &str) -> String {
        format!("({expr})::jsonb")
    }

    fn json_object_link(&self, id_expr: &str, title_expr: &str) -> String {
        format!("jsonb_build_object('id', {id_expr}, 'title', {title_expr})")
    }

    fn json_extract_title(&self, json_expr: &str) -> String {
        format!("(({json_expr})::jsonb ->> 'title')")
    }

    fn json_each_from(&self, json_expr: &str, alias: &str) -> String {
        format!("jsonb_array_elements(({json_expr})::jsonb) AS {}", self.quote_ident(alias))
    }

    fn json_each_value(&self, alias: &str) -> String {
        self.column(alias, "value")
    }

    fn json_array_contains(&self, json_expr: &str, value_expr: &str) -> String {
        format!(
            "EXISTS (SELECT 1 FROM jsonb_array_elements(({json_expr})::jsonb) AS \"je_c\" \
             WHERE COALESCE(\"je_c\" ->> 'title', \"je_c\" #>> '{{}}') = ({value_expr})::text)"
        )
    }

    fn string_agg(&self, expr: &str, separator: &str) -> String {
        format!("string_agg(({expr})::text, {})", self.quote_literal(separator))
    }

    fn contains_text(&self, haystack: &str, needle: &str) -> String {
        format!("(({haystack})::text ILIKE '%' || ({needle})::text || '%')")
    }

    fn relative_date(&self, offset_days: i64) -> String {
        format!("(CURRENT_DATE + {offset_days})")
    }

    fn date_literal(&self, iso: &str) -> String {
        format!("DATE {}", self.quote_literal(iso))
    }

    fn to_date(&self, expr: &str) -> String {
        format!("({expr})::date")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_embedded_quotes() {
        let d = SqliteDialect;
        assert_eq!(d.quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(d.quote_literal("it's"), "'it''s'");
        assert_eq!(d.column("t", "fld"), "\"t\".\"fld\"");
    }

    #[test]
    fn numbers_always_render_as_reals() {
        assert_eq!(number_literal(3.0), "3.0");
        assert_eq!(number_literal(0.5), "0.5");
        assert_eq!(number_literal(f64::NAN), "NULL");
    }

    #[test]
    fn dialects_differ_where_backends_differ() {
        assert_eq!(SqliteDialect.bool_literal(true), "1");
        assert_eq!(PostgresDialect.bool_literal(true), "TRUE");
        assert_eq!(SqliteDialect.relative_date(-1), "date('now', '-1 days')");
        assert_eq!(PostgresDialect.relative_date(2), "(CURRENT_DATE + 2)");
        assert!(PostgresDialect.json_array_agg("x", false).starts_with("jsonb_agg"));
    }
}
