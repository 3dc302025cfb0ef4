//! Compiled record queries executed against an in-memory SQLite database.
//!
//! Orders <-manyMany- Customers, with a rollup, a lookup, a formula over the
//! rollup and two conditional rollups on Customers.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use cellflow_core::condition::{
    Conjunction, FieldCondition, FilterGroup, FilterItem, FilterLeaf, FilterOperator, FilterValue,
};
use cellflow_core::link::{fk_column, junction_table_name, one_way_self_key};
use cellflow_core::{
    CellValue, Field, FieldId, LinkDbConfig, LookupOptions, RecordId, Relationship,
    RollupFunction, Schema, Table, TableId,
};
use cellflow_sql::state::MainTable;
use cellflow_sql::{
    CteStrategy, FieldSelectCompiler, QueryBuilderStateMut, QueryStateManager, RecordQueryBuilder,
    SqliteDialect,
};

fn fid(i: usize) -> FieldId {
    FieldId::parse(format!("fld{i:0>16}")).unwrap()
}

fn rid(c: char) -> RecordId {
    RecordId::parse(format!("rec{}", c.to_string().repeat(16))).unwrap()
}

fn orders_id() -> TableId {
    TableId::parse("tblOrders0000000000").unwrap()
}

fn customers_id() -> TableId {
    TableId::parse("tblCustomers0000000").unwrap()
}

const TITLE: usize = 1;
const AMOUNT: usize = 2;
const NAME: usize = 3;
const LINK: usize = 4;
const TOTAL: usize = 5;
const DOUBLE: usize = 6;
const STATUS: usize = 7;
const TITLES: usize = 8;
const INCLUDED: usize = 9;
const MIN_AMOUNT: usize = 10;
const ABOVE_MIN: usize = 11;

fn schema() -> Schema {
    let mut orders = Table::new("Orders").with_id(orders_id());
    orders.fields.push(Field::text("Title").with_id(fid(TITLE)).primary());
    orders.fields.push(Field::number("Amount").with_id(fid(AMOUNT)));
    orders.fields.push(Field::text("Status").with_id(fid(STATUS)));

    let through_link = LookupOptions {
        link_field_id: fid(LINK),
        foreign_table_id: orders_id(),
        lookup_field_id: fid(AMOUNT),
    };
    let mut link = Field::link("Orders", Relationship::ManyMany, orders_id(), fid(TITLE)).with_id(fid(LINK));
    if let Some(config) = link.link_config_mut() {
        config.is_one_way = true;
        config
            .set_db_config(
                &fid(LINK),
                LinkDbConfig {
                    fk_host_table_name: junction_table_name(&fid(LINK)),
                    self_key_name: one_way_self_key(&fid(LINK)),
                    foreign_key_name: fk_column(&fid(LINK)),
                },
            )
            .unwrap();
    }

    let mut customers = Table::new("Customers").with_id(customers_id());
    customers.fields.push(Field::text("Name").with_id(fid(NAME)).primary());
    customers.fields.push(link);
    customers
        .fields
        .push(Field::rollup("Total", through_link.clone(), RollupFunction::Sum).with_id(fid(TOTAL)));
    customers
        .fields
        .push(Field::formula("Double", format!("{{{}}} * 2", fid(TOTAL))).with_id(fid(DOUBLE)));
    customers.fields.push(
        Field::lookup(
            "Titles",
            LookupOptions {
                lookup_field_id: fid(TITLE),
                ..through_link
            },
        )
        .with_id(fid(TITLES)),
    );
    customers.fields.push(
        Field::conditional_rollup(
            "Included",
            orders_id(),
            fid(AMOUNT),
            FieldCondition::equals(fid(STATUS), CellValue::text("include")),
            RollupFunction::Count,
        )
        .with_id(fid(INCLUDED)),
    );
    customers.fields.push(Field::number("Min amount").with_id(fid(MIN_AMOUNT)));
    customers.fields.push(
        Field::conditional_rollup(
            "Above min",
            orders_id(),
            fid(AMOUNT),
            FieldCondition {
                filter: Some(FilterGroup {
                    conjunction: Conjunction::And,
                    items: vec![FilterItem::Leaf(FilterLeaf {
                        field_id: fid(AMOUNT),
                        operator: FilterOperator::IsGreater,
                        value: FilterValue::FieldRef(fid(MIN_AMOUNT)),
                    })],
                }),
                sort: None,
                limit: None,
            },
            RollupFunction::Sum,
        )
        .with_id(fid(ABOVE_MIN)),
    );

    let mut schema = Schema::new();
    schema.insert_table(orders);
    schema.insert_table(customers);
    schema
}

fn database() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    let ddl = format!(
        "CREATE TABLE \"{orders}\" (__id TEXT PRIMARY KEY, __auto_number INTEGER, \"{title}\" TEXT, \"{amount}\" REAL, \"{status}\" TEXT);
         CREATE TABLE \"{customers}\" (__id TEXT PRIMARY KEY, __auto_number INTEGER, \"{name}\" TEXT, \"{link}\" TEXT,
             \"{total}\" REAL, \"{double}\" REAL, \"{titles}\" TEXT, \"{included}\" REAL, \"{min}\" REAL, \"{above}\" REAL);
         CREATE TABLE \"{junction}\" (__id INTEGER PRIMARY KEY AUTOINCREMENT, \"{self_key}\" TEXT, \"{fk}\" TEXT);",
        orders = orders_id(),
        customers = customers_id(),
        title = fid(TITLE),
        amount = fid(AMOUNT),
        status = fid(STATUS),
        name = fid(NAME),
        link = fid(LINK),
        total = fid(TOTAL),
        double = fid(DOUBLE),
        titles = fid(TITLES),
        included = fid(INCLUDED),
        min = fid(MIN_AMOUNT),
        above = fid(ABOVE_MIN),
        junction = junction_table_name(&fid(LINK)),
        self_key = one_way_self_key(&fid(LINK)),
        fk = fk_column(&fid(LINK)),
    );
    conn.execute_batch(&ddl).unwrap();

    for (n, (id, title, amount, status)) in [
        (rid('A'), "A", 10.0, "include"),
        (rid('B'), "B", 25.0, "exclude"),
        (rid('C'), "C", 5.0, "include"),
    ]
    .into_iter()
    .enumerate()
    {
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (__id, __auto_number, \"{}\", \"{}\", \"{}\") VALUES (?1, ?2, ?3, ?4, ?5)",
                orders_id(),
                fid(TITLE),
                fid(AMOUNT),
                fid(STATUS)
            ),
            rusqlite::params![id.as_str(), n as i64 + 1, title, amount, status],
        )
        .unwrap();
    }
    for (n, (id, name, min, total)) in [(rid('X'), "Xena", 7.0, 99.0), (rid('Y'), "Yuri", 0.0, 99.0)]
        .into_iter()
        .enumerate()
    {
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (__id, __auto_number, \"{}\", \"{}\", \"{}\") VALUES (?1, ?2, ?3, ?4, ?5)",
                customers_id(),
                fid(NAME),
                fid(MIN_AMOUNT),
                fid(TOTAL)
            ),
            rusqlite::params![id.as_str(), n as i64 + 1, name, min, total],
        )
        .unwrap();
    }
    for order in [rid('B'), rid('A')] {
        conn.execute(
            &format!(
                "INSERT INTO \"{}\" (\"{}\", \"{}\") VALUES (?1, ?2)",
                junction_table_name(&fid(LINK)),
                one_way_self_key(&fid(LINK)),
                fk_column(&fid(LINK))
            ),
            rusqlite::params![rid('X').as_str(), order.as_str()],
        )
        .unwrap();
    }
    conn
}

/// Runs a compiled query, returning `(record id, values)` rows.
fn run(conn: &Connection, sql: &str, params: &[String]) -> Vec<(String, Vec<Value>)> {
    let mut stmt = conn.prepare(sql).unwrap_or_else(|e| panic!("{e}\n{sql}"));
    let width = stmt.column_count();
    stmt.query_map(params_from_iter(params.iter()), |row| {
        let id: String = row.get(0)?;
        let values = (1..width).map(|i| row.get::<_, Value>(i)).collect::<Result<Vec<_>, _>>()?;
        Ok((id, values))
    })
    .unwrap()
    .collect::<Result<Vec<_>, _>>()
    .unwrap()
}

fn num(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Real(r) => Some(*r),
        _ => None,
    }
}

/// Text value with an empty JSON array read as null.
fn text(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) if s != "[]" => Some(s.clone()),
        _ => None,
    }
}

#[test]
fn both_strategies_compute_the_same_values() {
    let schema = schema();
    let conn = database();
    let fields = [fid(TOTAL), fid(DOUBLE), fid(TITLES), fid(INCLUDED), fid(ABOVE_MIN), fid(LINK)];

    for strategy in [CteStrategy::Join, CteStrategy::Correlated] {
        let query = RecordQueryBuilder::new(&schema, &SqliteDialect, customers_id())
            .with_strategy(strategy)
            .build(&fields, None)
            .unwrap();
        assert!(query.failed.is_empty(), "{strategy}: {:?}", query.failed);
        assert_eq!(query.sql.contains("WITH "), strategy == CteStrategy::Join);

        let rows = run(&conn, &query.sql, &query.params);
        assert_eq!(rows.len(), 2, "{strategy}");

        let (id, xena) = &rows[0];
        assert_eq!(id, rid('X').as_str());
        assert_eq!(num(&xena[0]), Some(35.0), "{strategy}: total");
        assert_eq!(num(&xena[1]), Some(70.0), "{strategy}: double");
        // Linked records come back in the foreign table's order.
        assert_eq!(text(&xena[2]).as_deref(), Some(r#"["A","B"]"#), "{strategy}: titles");
        assert_eq!(num(&xena[3]), Some(2.0), "{strategy}: included");
        assert_eq!(num(&xena[4]), Some(35.0), "{strategy}: above min");
        let links: serde_json::Value = serde_json::from_str(&text(&xena[5]).unwrap()).unwrap();
        let titles: Vec<&str> = links
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["A", "B"]);
        assert_eq!(links[0]["id"], rid('A').as_str());

        let (id, yuri) = &rows[1];
        assert_eq!(id, rid('Y').as_str());
        assert_eq!(num(&yuri[0]), Some(0.0), "{strategy}: empty sum is zero");
        assert_eq!(num(&yuri[1]), Some(0.0), "{strategy}: double of zero");
        assert_eq!(text(&yuri[2]), None, "{strategy}: no titles");
        assert_eq!(num(&yuri[3]), Some(2.0), "{strategy}: included ignores links");
        assert_eq!(num(&yuri[4]), Some(40.0), "{strategy}: above min");
        assert_eq!(text(&yuri[5]), None, "{strategy}: no links");
    }
}

#[test]
fn record_restriction_binds_ids() {
    let schema = schema();
    let conn = database();
    let query = RecordQueryBuilder::new(&schema, &SqliteDialect, customers_id())
        .build(&[fid(TOTAL)], Some(&[rid('Y')][..]))
        .unwrap();
    let rows = run(&conn, &query.sql, &query.params);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, rid('Y').as_str());
    assert_eq!(num(&rows[0].1[0]), Some(0.0));
}

#[test]
fn registered_but_unjoined_cte_reads_the_persisted_column() {
    let schema = schema();
    let conn = database();
    let mut state = QueryStateManager::new();
    state
        .set_main_table(MainTable {
            alias: "t".into(),
            physical_name: customers_id().to_string(),
        })
        .unwrap();
    state.register_cte(fid(TOTAL), "total", "SELECT 1".into());

    let selection = {
        let mut compiler = FieldSelectCompiler::new(&schema, &SqliteDialect, &mut state, customers_id(), "t");
        compiler.compile(&fid(TOTAL)).unwrap()
    };
    assert_eq!(selection, format!("\"t\".\"{}\"", fid(TOTAL)));

    let sql = format!(
        "SELECT \"t\".\"__id\", {selection} FROM \"{}\" AS \"t\" ORDER BY \"t\".\"__auto_number\"",
        customers_id()
    );
    let rows = run(&conn, &sql, &[]);
    // The stored value, not the freshly aggregated 35.
    assert_eq!(num(&rows[0].1[0]), Some(99.0));
}

#[test]
fn broken_formula_selects_null_and_is_reported() {
    let mut schema = schema();
    schema
        .table_mut(&customers_id())
        .unwrap()
        .fields
        .push(Field::formula("Broken", "1 +").with_id(fid(12)));
    let conn = database();
    conn.execute_batch(&format!(
        "ALTER TABLE \"{}\" ADD COLUMN \"{}\" REAL",
        customers_id(),
        fid(12)
    ))
    .unwrap();

    let query = RecordQueryBuilder::new(&schema, &SqliteDialect, customers_id())
        .build(&[fid(12), fid(TOTAL)], None)
        .unwrap();
    assert_eq!(query.failed.len(), 1);
    assert_eq!(query.failed[0].0, fid(12));
    let rows = run(&conn, &query.sql, &query.params);
    assert_eq!(rows[0].1[0], Value::Null);
    assert_eq!(num(&rows[0].1[1]), Some(35.0));
}
