//! The field dependency graph.
//!
//! Nodes are fields (an arena keyed by [`FieldId`]); an edge `a -> b` means
//! "`b` reads `a`", the same direction as a persisted [`Reference`]. Edges
//! carry an [`EdgeKind`] telling the propagation orchestrator how to map
//! changed records of `a`'s table onto affected records of `b`'s table.
//!
//! # Build policy
//!
//! - A dependency cycle anywhere in the schema fails the build with
//!   [`CoreError::DependencyCycle`] naming the fields of one minimal cycle.
//! - A computed field whose link, foreign table or foreign field cannot be
//!   resolved does not fail the build. It is reported in
//!   [`DependencyGraph::broken_fields`] and keeps only the edges that do
//!   resolve, so unrelated fields stay usable.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::CoreError;
use crate::field::{Field, FormulaOptions};
use crate::formula::Formula;
use crate::id::{FieldId, TableId};
use crate::link::LinkFieldConfig;
use crate::lookup::{ConditionalRollupConfig, LookupOptions, RollupFieldConfig};
use crate::schema::Schema;
use crate::visitor::FieldVisitor;

/// A persisted dependency edge: `to` reads `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub from_field_id: FieldId,
    pub to_field_id: FieldId,
}

/// How a dependency reaches its dependent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EdgeKind {
    /// Both fields live on the same table; the same record is affected.
    SameTable,
    /// The dependent reads a foreign field through `via_link`; records
    /// linked to the changed foreign records are affected.
    CrossTable { via_link: FieldId },
    /// The dependent selects foreign rows by a condition; every record of
    /// the dependent's table is affected.
    Condition,
}

/// One dependency of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub field: FieldId,
    pub kind: EdgeKind,
}

/// A computed field whose configuration no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokenField {
    pub field_id: FieldId,
    pub table_id: TableId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldNode {
    id: FieldId,
    table_id: TableId,
    computed: bool,
}

// ---------------------------------------------------------------------------
// Dependency extraction
// ---------------------------------------------------------------------------

/// Dependencies found for one field, plus the first reference that failed
/// to resolve, if any.
#[derive(Debug, Default)]
pub struct Extracted {
    pub dependencies: SmallVec<[Dependency; 4]>,
    pub broken: Option<String>,
}

impl Extracted {
    fn push(&mut self, field: FieldId, kind: EdgeKind) {
        if !self.dependencies.iter().any(|d| d.field == field) {
            self.dependencies.push(Dependency { field, kind });
        }
    }

    fn broken(&mut self, reason: impl Into<String>) {
        if self.broken.is_none() {
            self.broken = Some(reason.into());
        }
    }
}

/// Extracts a field's dependencies from its configuration.
pub struct DependencyExtractor<'a> {
    schema: &'a Schema,
    table_id: &'a TableId,
}

impl<'a> DependencyExtractor<'a> {
    pub fn new(schema: &'a Schema, table_id: &'a TableId) -> Self {
        DependencyExtractor { schema, table_id }
    }

    fn host_field_exists(&self, id: &FieldId) -> bool {
        self.schema
            .table(self.table_id)
            .is_some_and(|t| t.field(id).is_some())
    }

    fn foreign_field_exists(&self, table: &TableId, id: &FieldId) -> bool {
        self.schema.table(table).is_some_and(|t| t.field(id).is_some())
    }

    fn through_link(&self, options: &LookupOptions, out: &mut Extracted) {
        let link = self
            .schema
            .table(self.table_id)
            .and_then(|t| t.field(&options.link_field_id))
            .and_then(Field::link_config);
        match link {
            Some(link) if link.foreign_table_id == options.foreign_table_id => {
                out.push(options.link_field_id.clone(), EdgeKind::SameTable);
            }
            Some(_) => out.broken(format!(
                "link {} no longer points to table {}",
                options.link_field_id, options.foreign_table_id
            )),
            None => out.broken(format!("link field {} not found", options.link_field_id)),
        }
        if !self.schema.contains_table(&options.foreign_table_id) {
            out.broken(format!("foreign table {} not found", options.foreign_table_id));
        } else if self.foreign_field_exists(&options.foreign_table_id, &options.lookup_field_id) {
            out.push(
                options.lookup_field_id.clone(),
                EdgeKind::CrossTable {
                    via_link: options.link_field_id.clone(),
                },
            );
        } else {
            out.broken(format!("lookup field {} not found", options.lookup_field_id));
        }
    }
}

impl FieldVisitor for DependencyExtractor<'_> {
    type Output = Extracted;

    fn visit_single_line_text(&mut self, _field: &Field) -> Extracted {
        Extracted::default()
    }

    fn visit_long_text(&mut self, _field: &Field) -> Extracted {
        Extracted::default()
    }

    fn visit_number(&mut self, _field: &Field, _precision: u8) -> Extracted {
        Extracted::default()
    }

    fn visit_checkbox(&mut self, _field: &Field) -> Extracted {
        Extracted::default()
    }

    fn visit_single_select(&mut self, _field: &Field, _choices: &[String]) -> Extracted {
        Extracted::default()
    }

    fn visit_date(&mut self, _field: &Field) -> Extracted {
        Extracted::default()
    }

    /// A link's display value reads the foreign title field.
    fn visit_link(&mut self, field: &Field, config: &LinkFieldConfig) -> Extracted {
        let mut out = Extracted::default();
        if !self.schema.contains_table(&config.foreign_table_id) {
            out.broken(format!("foreign table {} not found", config.foreign_table_id));
        } else if self.foreign_field_exists(&config.foreign_table_id, &config.lookup_field_id) {
            out.push(
                config.lookup_field_id.clone(),
                EdgeKind::CrossTable {
                    via_link: field.id.clone(),
                },
            );
        } else {
            out.broken(format!("link title field {} not found", config.lookup_field_id));
        }
        out
    }

    fn visit_formula(&mut self, _field: &Field, options: &FormulaOptions) -> Extracted {
        let mut out = Extracted::default();
        match Formula::parse(&options.expression) {
            Ok(formula) => {
                for reference in formula.references() {
                    if self.host_field_exists(&reference) {
                        out.push(reference, EdgeKind::SameTable);
                    } else {
                        out.broken(format!("referenced field {reference} not found"));
                    }
                }
            }
            Err(e) => out.broken(format!("expression does not parse: {e}")),
        }
        out
    }

    fn visit_lookup(&mut self, _field: &Field, options: &LookupOptions) -> Extracted {
        let mut out = Extracted::default();
        self.through_link(options, &mut out);
        out
    }

    fn visit_rollup(&mut self, _field: &Field, config: &RollupFieldConfig) -> Extracted {
        let mut out = Extracted::default();
        self.through_link(&config.options, &mut out);
        out
    }

    fn visit_conditional_rollup(
        &mut self,
        _field: &Field,
        config: &ConditionalRollupConfig,
    ) -> Extracted {
        let mut out = Extracted::default();
        let opts = &config.options;
        if !self.schema.contains_table(&opts.foreign_table_id) {
            out.broken(format!("foreign table {} not found", opts.foreign_table_id));
            return out;
        }
        let mut foreign = vec![opts.lookup_field_id.clone()];
        foreign.extend(opts.condition.referenced_foreign_fields());
        for id in foreign {
            if self.foreign_field_exists(&opts.foreign_table_id, &id) {
                out.push(id, EdgeKind::Condition);
            } else {
                out.broken(format!("foreign field {id} not found"));
            }
        }
        for id in opts.condition.referenced_host_fields() {
            if self.host_field_exists(&id) {
                out.push(id, EdgeKind::SameTable);
            } else {
                out.broken(format!("host field {id} referenced by condition not found"));
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// The validated, acyclic dependency graph of a schema.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<FieldNode, EdgeKind>,
    index: HashMap<FieldId, NodeIndex>,
    broken: Vec<BrokenField>,
}

impl DependencyGraph {
    /// Builds the graph over every table of `schema`.
    pub fn build(schema: &Schema) -> Result<DependencyGraph, CoreError> {
        let tables: Vec<TableId> = schema.tables().map(|t| t.id.clone()).collect();
        Self::build_over(schema, &tables)
    }

    /// Builds the graph for `table` and every table reachable from it
    /// through link, lookup and condition references.
    pub fn build_table(schema: &Schema, table: &TableId) -> Result<DependencyGraph, CoreError> {
        if !schema.contains_table(table) {
            return Err(CoreError::UnknownTable { id: table.clone() });
        }
        let mut reachable: IndexSet<TableId> = IndexSet::new();
        let mut queue = VecDeque::from([table.clone()]);
        while let Some(current) = queue.pop_front() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            let Some(t) = schema.table(&current) else {
                continue;
            };
            for field in &t.fields {
                for foreign in foreign_tables_of(field) {
                    if schema.contains_table(&foreign) && !reachable.contains(&foreign) {
                        queue.push_back(foreign);
                    }
                }
            }
        }
        let tables: Vec<TableId> = reachable.into_iter().collect();
        Self::build_over(schema, &tables)
    }

    fn build_over(schema: &Schema, tables: &[TableId]) -> Result<DependencyGraph, CoreError> {
        let mut graph: DiGraph<FieldNode, EdgeKind> = DiGraph::new();
        let mut index = HashMap::new();

        for table_id in tables {
            let Some(table) = schema.table(table_id) else {
                continue;
            };
            for field in &table.fields {
                let idx = graph.add_node(FieldNode {
                    id: field.id.clone(),
                    table_id: table_id.clone(),
                    computed: field.is_computed(),
                });
                index.insert(field.id.clone(), idx);
            }
        }

        let mut broken = Vec::new();
        for table_id in tables {
            let Some(table) = schema.table(table_id) else {
                continue;
            };
            for field in &table.fields {
                let extracted = field.accept(&mut DependencyExtractor::new(schema, table_id));
                let to = index[&field.id];
                for dep in extracted.dependencies {
                    // Dependencies on tables outside the built set are cut.
                    if let Some(&from) = index.get(&dep.field) {
                        graph.add_edge(from, to, dep.kind);
                    }
                }
                if let Some(reason) = extracted.broken {
                    broken.push(BrokenField {
                        field_id: field.id.clone(),
                        table_id: table_id.clone(),
                        reason,
                    });
                }
            }
        }

        let built = DependencyGraph {
            graph,
            index,
            broken,
        };
        built.check_acyclic()?;
        Ok(built)
    }

    /// Fails with the fields of one minimal cycle, if the graph has any.
    fn check_acyclic(&self) -> Result<(), CoreError> {
        for scc in tarjan_scc(&self.graph) {
            let is_cycle = scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]);
            if !is_cycle {
                continue;
            }
            let start = scc.iter().copied().min().unwrap_or(scc[0]);
            let members: HashSet<NodeIndex> = scc.iter().copied().collect();
            let cycle = self.shortest_cycle(start, &members);
            return Err(CoreError::DependencyCycle {
                cycle: cycle
                    .into_iter()
                    .map(|idx| self.graph[idx].id.clone())
                    .collect(),
            });
        }
        Ok(())
    }

    /// BFS from `start` back to itself inside one strongly connected
    /// component, returning the path in traversal order.
    fn shortest_cycle(&self, start: NodeIndex, members: &HashSet<NodeIndex>) -> Vec<NodeIndex> {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if !members.contains(&next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![node];
                    let mut cursor = node;
                    while let Some(&p) = parent.get(&cursor) {
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    return path;
                }
                if seen.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        vec![start]
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn contains(&self, field: &FieldId) -> bool {
        self.index.contains_key(field)
    }

    pub fn table_of(&self, field: &FieldId) -> Option<&TableId> {
        self.index.get(field).map(|&idx| &self.graph[idx].table_id)
    }

    pub fn broken_fields(&self) -> &[BrokenField] {
        &self.broken
    }

    pub fn is_broken(&self, field: &FieldId) -> bool {
        self.broken.iter().any(|b| &b.field_id == field)
    }

    /// Fields that directly read `field`.
    pub fn dependents(&self, field: &FieldId) -> Vec<FieldId> {
        self.neighbors(field, Direction::Outgoing)
    }

    /// Fields `field` directly reads.
    pub fn dependencies(&self, field: &FieldId) -> Vec<FieldId> {
        self.neighbors(field, Direction::Incoming)
    }

    /// Direct dependencies of `field` with the kind of each edge.
    pub fn incoming(&self, field: &FieldId) -> Vec<Dependency> {
        let Some(&idx) = self.index.get(field) else {
            return Vec::new();
        };
        let mut out: Vec<Dependency> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| Dependency {
                field: self.graph[e.source()].id.clone(),
                kind: e.weight().clone(),
            })
            .collect();
        out.sort_by(|a, b| a.field.cmp(&b.field));
        out
    }

    fn neighbors(&self, field: &FieldId, dir: Direction) -> Vec<FieldId> {
        let Some(&idx) = self.index.get(field) else {
            return Vec::new();
        };
        let mut out: Vec<FieldId> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|n| self.graph[n].id.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Every edge as a persistable reference, sorted.
    pub fn references(&self) -> Vec<Reference> {
        let mut out: Vec<Reference> = self
            .graph
            .edge_references()
            .map(|e| Reference {
                from_field_id: self.graph[e.source()].id.clone(),
                to_field_id: self.graph[e.target()].id.clone(),
            })
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Transitive dependents of `triggers`.
    ///
    /// Triggers themselves are part of the closure only when they are
    /// computed (a written primitive value needs no recomputation).
    pub fn affected_closure(&self, triggers: &[FieldId]) -> IndexSet<FieldId> {
        let mut closure = IndexSet::new();
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue = VecDeque::new();
        for trigger in triggers {
            let Some(&idx) = self.index.get(trigger) else {
                continue;
            };
            if self.graph[idx].computed {
                closure.insert(trigger.clone());
            }
            if seen.insert(idx) {
                queue.push_back(idx);
            }
        }
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                closure.insert(self.graph[next].id.clone());
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        closure
    }

    /// Topological order of `subset`, restricted to edges inside it.
    ///
    /// Kahn's algorithm with ties broken by node creation order, so the
    /// result is deterministic for a given schema.
    pub fn topological_order(&self, subset: &IndexSet<FieldId>) -> Vec<FieldId> {
        let nodes: BTreeSet<NodeIndex> = subset
            .iter()
            .filter_map(|f| self.index.get(f).copied())
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> = nodes.iter().map(|&n| (n, 0)).collect();
        for &n in &nodes {
            for source in self.graph.neighbors_directed(n, Direction::Incoming) {
                if nodes.contains(&source) {
                    *in_degree.entry(n).or_insert(0) += 1;
                }
            }
        }

        let mut ready: BTreeSet<NodeIndex> = nodes
            .iter()
            .copied()
            .filter(|n| in_degree.get(n) == Some(&0))
            .collect();
        let mut sorted = Vec::with_capacity(nodes.len());
        while let Some(n) = ready.pop_first() {
            sorted.push(self.graph[n].id.clone());
            for target in self.graph.neighbors_directed(n, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&target) {
                    // Parallel edges were counted once per edge above.
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(target);
                    }
                }
            }
        }
        sorted
    }

    /// Orders a closure into per-table batches.
    ///
    /// Batches follow the global topological order; consecutive fields of
    /// the same table share a batch. A table appears more than once when
    /// its fields depend on another table that itself reads it.
    pub fn order_by_table(&self, closure: &IndexSet<FieldId>) -> Vec<(TableId, Vec<FieldId>)> {
        let mut batches: Vec<(TableId, Vec<FieldId>)> = Vec::new();
        for field in self.topological_order(closure) {
            let Some(table) = self.table_of(&field).cloned() else {
                continue;
            };
            match batches.last_mut() {
                Some((last, fields)) if *last == table => fields.push(field),
                _ => batches.push((table, vec![field])),
            }
        }
        batches
    }

    /// Per-table closure grouping, preserving topological order within each
    /// table.
    pub fn group_by_table(&self, closure: &IndexSet<FieldId>) -> IndexMap<TableId, Vec<FieldId>> {
        let mut out: IndexMap<TableId, Vec<FieldId>> = IndexMap::new();
        for field in self.topological_order(closure) {
            if let Some(table) = self.table_of(&field) {
                out.entry(table.clone()).or_default().push(field);
            }
        }
        out
    }

    /// Evaluation order of every computed field of `table`.
    pub fn evaluation_order(&self, table: &TableId) -> Vec<FieldId> {
        let computed: IndexSet<FieldId> = self
            .graph
            .node_indices()
            .filter(|&n| self.graph[n].computed && &self.graph[n].table_id == table)
            .map(|n| self.graph[n].id.clone())
            .collect();
        self.topological_order(&computed)
    }
}

/// Tables a field's configuration points at.
fn foreign_tables_of(field: &Field) -> Vec<TableId> {
    use crate::field::FieldKind;
    match &field.kind {
        FieldKind::Link(cfg) => vec![cfg.foreign_table_id.clone()],
        FieldKind::Lookup(opts) => vec![opts.foreign_table_id.clone()],
        FieldKind::Rollup(cfg) => vec![cfg.options.foreign_table_id.clone()],
        FieldKind::ConditionalRollup(cfg) => vec![cfg.options.foreign_table_id.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Relationship;
    use crate::lookup::RollupFunction;
    use crate::schema::Table;

    fn tid(c: char) -> TableId {
        TableId::parse(format!("tbl{}", c.to_string().repeat(16))).unwrap()
    }

    fn fid(c: char) -> FieldId {
        FieldId::parse(format!("fld{}", c.to_string().repeat(16))).unwrap()
    }

    fn formula(c: char, name: &str, expr: String) -> Field {
        Field::formula(name, expr).with_id(fid(c))
    }

    fn abc() -> Schema {
        let mut t = Table::new("T").with_id(tid('T'));
        t.fields.push(Field::number("A").with_id(fid('A')));
        t.fields.push(formula('B', "B", format!("{{{}}} + 1", fid('A'))));
        t.fields.push(formula('C', "C", format!("{{{}}} * 2", fid('B'))));
        let mut schema = Schema::new();
        schema.insert_table(t);
        schema
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let graph = DependencyGraph::build(&abc()).unwrap();
        assert_eq!(graph.dependents(&fid('A')), vec![fid('B')]);
        assert_eq!(graph.dependencies(&fid('C')), vec![fid('B')]);

        let closure = graph.affected_closure(&[fid('A')]);
        assert_eq!(closure.iter().cloned().collect::<Vec<_>>(), vec![fid('B'), fid('C')]);
        assert_eq!(
            graph.order_by_table(&closure),
            vec![(tid('T'), vec![fid('B'), fid('C')])]
        );
        assert_eq!(graph.evaluation_order(&tid('T')), vec![fid('B'), fid('C')]);
    }

    #[test]
    fn same_table_cycle_is_rejected_with_members() {
        let mut schema = abc();
        let table = schema.table_mut(&tid('T')).unwrap();
        table.fields[0] = formula('A', "A", format!("{{{}}} - 1", fid('C')));
        let err = DependencyGraph::build(&schema).unwrap_err();
        let cycle = match err {
            CoreError::DependencyCycle { cycle } => cycle,
            other => panic!("expected a cycle error, got {other:?}"),
        };
        assert_eq!(cycle.len(), 3);
        for f in ['A', 'B', 'C'] {
            assert!(cycle.contains(&fid(f)));
        }
    }

    #[test]
    fn cross_table_cycle_through_links_is_rejected() {
        // T1.total rolls up T2.mirror_total, which looks up T1.total.
        let mut t1 = Table::new("T1").with_id(tid('A'));
        let mut t2 = Table::new("T2").with_id(tid('B'));
        t1.fields.push(Field::text("Name").with_id(fid('N')));
        t2.fields.push(Field::text("Name").with_id(fid('M')));
        t1.fields
            .push(Field::link("L1", Relationship::ManyMany, tid('B'), fid('M')).with_id(fid('L')));
        t2.fields
            .push(Field::link("L2", Relationship::ManyMany, tid('A'), fid('N')).with_id(fid('K')));
        t1.fields.push(
            Field::rollup(
                "Total",
                LookupOptions {
                    link_field_id: fid('L'),
                    foreign_table_id: tid('B'),
                    lookup_field_id: fid('Y'),
                },
                RollupFunction::Sum,
            )
            .with_id(fid('X')),
        );
        t2.fields.push(
            Field::lookup(
                "Back",
                LookupOptions {
                    link_field_id: fid('K'),
                    foreign_table_id: tid('A'),
                    lookup_field_id: fid('X'),
                },
            )
            .with_id(fid('Y')),
        );
        let mut schema = Schema::new();
        schema.insert_table(t1);
        schema.insert_table(t2);

        let err = DependencyGraph::build_table(&schema, &tid('A')).unwrap_err();
        let fields = err.fields();
        assert!(fields.contains(&fid('X')));
        assert!(fields.contains(&fid('Y')));
    }

    #[test]
    fn dangling_lookup_is_broken_not_fatal() {
        let mut schema = abc();
        schema.table_mut(&tid('T')).unwrap().fields.push(
            Field::lookup(
                "Gone",
                LookupOptions {
                    link_field_id: fid('Z'),
                    foreign_table_id: tid('Z'),
                    lookup_field_id: fid('Q'),
                },
            )
            .with_id(fid('G')),
        );
        let graph = DependencyGraph::build(&schema).unwrap();
        assert!(graph.is_broken(&fid('G')));
        assert!(!graph.is_broken(&fid('B')));
        assert_eq!(graph.evaluation_order(&tid('T')), vec![fid('B'), fid('C'), fid('G')]);
    }

    #[test]
    fn references_match_dependencies() {
        let graph = DependencyGraph::build(&abc()).unwrap();
        assert_eq!(
            graph.references(),
            vec![
                Reference {
                    from_field_id: fid('A'),
                    to_field_id: fid('B'),
                },
                Reference {
                    from_field_id: fid('B'),
                    to_field_id: fid('C'),
                },
            ]
        );
    }
}
