//! Property tests for the dependency graph builder: a schema builds iff it
//! is acyclic, and the evaluation order always puts dependencies first.

use proptest::prelude::*;

use cellflow_core::{CoreError, DependencyGraph, Field, FieldId, Schema, Table, TableId};

fn fid(i: usize) -> FieldId {
    FieldId::parse(format!("fld{i:0>16}")).unwrap()
}

fn table_id() -> TableId {
    TableId::parse("tblPROPTESTPROPTEST").unwrap()
}

/// A chain `f1 <- f0`, `f2 <- f1`, ... plus random extra backward
/// references, always acyclic.
fn chain_schema(extra: &[Vec<bool>]) -> Schema {
    let mut table = Table::new("P").with_id(table_id());
    table.fields.push(Field::number("f0").with_id(fid(0)));
    for (i, extras) in extra.iter().enumerate() {
        let i = i + 1;
        let mut refs = vec![format!("{{{}}}", fid(i - 1))];
        for (j, &on) in extras.iter().enumerate().take(i.saturating_sub(1)) {
            if on {
                refs.push(format!("{{{}}}", fid(j)));
            }
        }
        table
            .fields
            .push(Field::formula(format!("f{i}"), refs.join(" + ")).with_id(fid(i)));
    }
    let mut schema = Schema::new();
    schema.insert_table(table);
    schema
}

fn extras_strategy() -> impl Strategy<Value = Vec<Vec<bool>>> {
    (1usize..12).prop_flat_map(|n| prop::collection::vec(prop::collection::vec(any::<bool>(), n), n))
}

proptest! {
    #[test]
    fn acyclic_schemas_build_and_order_dependencies_first(extra in extras_strategy()) {
        let schema = chain_schema(&extra);
        let graph = DependencyGraph::build(&schema).unwrap();
        let order = graph.evaluation_order(&table_id());
        prop_assert_eq!(order.len(), extra.len());
        for (pos, field) in order.iter().enumerate() {
            for dep in graph.dependencies(field) {
                if let Some(dep_pos) = order.iter().position(|f| f == &dep) {
                    prop_assert!(dep_pos < pos, "{} ordered before its dependency {}", field, dep);
                }
            }
        }
    }

    #[test]
    fn a_back_edge_is_rejected_naming_a_cycle_member(
        extra in extras_strategy(),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut schema = chain_schema(&extra);
        let k = pick.index(extra.len()) + 1;
        // f0 now reads fk, which transitively reads f0.
        let table = schema.table_mut(&table_id()).unwrap();
        table.fields[0] = Field::formula("f0", format!("{{{}}} + 1", fid(k))).with_id(fid(0));

        match DependencyGraph::build(&schema) {
            Err(CoreError::DependencyCycle { cycle }) => {
                prop_assert!(!cycle.is_empty());
                prop_assert!(cycle.contains(&fid(0)));
                for member in &cycle {
                    prop_assert!((0..=k).any(|i| &fid(i) == member));
                }
            }
            other => prop_assert!(false, "expected a cycle error, got {:?}", other),
        }
    }
}

#[test]
fn closure_spans_tables_through_rollups() {
    use cellflow_core::{LookupOptions, Relationship, RollupFunction};

    let t1 = TableId::parse("tblAAAAAAAAAAAAAAAA").unwrap();
    let t2 = TableId::parse("tblBBBBBBBBBBBBBBBB").unwrap();
    let mut orders = Table::new("Orders").with_id(t1.clone());
    orders.fields.push(Field::text("Title").with_id(fid(1)).primary());
    orders.fields.push(Field::number("Amount").with_id(fid(2)));
    let mut customers = Table::new("Customers").with_id(t2.clone());
    customers.fields.push(Field::text("Name").with_id(fid(3)).primary());
    customers
        .fields
        .push(Field::link("Orders", Relationship::ManyMany, t1.clone(), fid(1)).with_id(fid(4)));
    customers.fields.push(
        Field::rollup(
            "Total",
            LookupOptions {
                link_field_id: fid(4),
                foreign_table_id: t1,
                lookup_field_id: fid(2),
            },
            RollupFunction::Sum,
        )
        .with_id(fid(5)),
    );
    customers
        .fields
        .push(Field::formula("Double", format!("{{{}}} * 2", fid(5))).with_id(fid(6)));
    let mut schema = Schema::new();
    schema.insert_table(orders);
    schema.insert_table(customers);

    let graph = DependencyGraph::build(&schema).unwrap();
    let closure = graph.affected_closure(&[fid(2)]);
    assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![fid(5), fid(6)]);

    // Renaming an order reaches the link display and everything reading the link.
    let closure = graph.affected_closure(&[fid(1)]);
    assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![fid(4), fid(5), fid(6)]);
    assert_eq!(
        graph.order_by_table(&graph.affected_closure(&[fid(2)])),
        vec![(t2, vec![fid(5), fid(6)])]
    );
}
