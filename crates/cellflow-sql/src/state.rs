//! Query-builder state shared through one compilation.
//!
//! The state is an explicit context object passed by reference through the
//! compiler. Two implementations exist:
//!
//! - [`QueryStateManager`]: the full read/write state of one record query.
//! - [`ScopedSelectionState`]: a selection-only view over a parent state,
//!   used for nested compilations (a conditional rollup's filter) so that
//!   exploratory selections never leak into the outer query. Its CTE,
//!   main-table and base-CTE mutators panic: calling them is a bug in the
//!   compiler, not a runtime condition.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use cellflow_core::FieldId;

use crate::error::SqlError;

/// Alias and physical name of the query's main table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainTable {
    pub alias: String,
    pub physical_name: String,
}

/// A registered common table expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CteDefinition {
    pub name: String,
    pub body: String,
}

/// Read access to query-builder state.
pub trait QueryBuilderState {
    fn main_table(&self) -> Option<&MainTable>;

    fn base_cte(&self) -> Option<&str>;

    /// Name of the CTE computing `field`, if one was registered.
    fn cte_for_field(&self, field: &FieldId) -> Option<&str>;

    /// Whether `cte` is joined into the query this state compiles.
    fn is_cte_joined(&self, cte: &str) -> bool;

    /// Memoized selection fragment of `field`.
    fn selection(&self, field: &FieldId) -> Option<&str>;
}

/// Write access to query-builder state.
pub trait QueryBuilderStateMut: QueryBuilderState {
    /// Captures the main table once; a conflicting later value is refused.
    fn set_main_table(&mut self, table: MainTable) -> Result<(), SqlError>;

    fn set_base_cte(&mut self, name: String);

    /// Registers `body` under a fresh name derived from `hint` and maps
    /// `field` to it. Returns the chosen name.
    fn register_cte(&mut self, field: FieldId, hint: &str, body: String) -> String;

    fn mark_cte_joined(&mut self, name: &str);

    fn set_selection(&mut self, field: FieldId, sql: String);
}

// ---------------------------------------------------------------------------
// Full state
// ---------------------------------------------------------------------------

/// Read/write state for the top level of one record query.
#[derive(Debug, Default)]
pub struct QueryStateManager {
    main_table: Option<MainTable>,
    base_cte: Option<String>,
    field_ctes: IndexMap<FieldId, String>,
    ctes: Vec<CteDefinition>,
    joined: HashSet<String>,
    selections: HashMap<FieldId, String>,
}

impl QueryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered CTEs in registration order.
    pub fn cte_definitions(&self) -> &[CteDefinition] {
        &self.ctes
    }

    /// Registered CTEs that were joined, in registration order.
    pub fn joined_ctes(&self) -> impl Iterator<Item = &CteDefinition> {
        self.ctes.iter().filter(|c| self.joined.contains(&c.name))
    }

    fn unique_name(&self, hint: &str) -> String {
        let base: String = hint
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let mut name = format!("cte_{base}");
        let mut n = 2;
        while self.ctes.iter().any(|c| c.name == name) {
            name = format!("cte_{base}_{n}");
            n += 1;
        }
        name
    }
}

impl QueryBuilderState for QueryStateManager {
    fn main_table(&self) -> Option<&MainTable> {
        self.main_table.as_ref()
    }

    fn base_cte(&self) -> Option<&str> {
        self.base_cte.as_deref()
    }

    fn cte_for_field(&self, field: &FieldId) -> Option<&str> {
        self.field_ctes.get(field).map(String::as_str)
    }

    fn is_cte_joined(&self, cte: &str) -> bool {
        self.joined.contains(cte)
    }

    fn selection(&self, field: &FieldId) -> Option<&str> {
        self.selections.get(field).map(String::as_str)
    }
}

impl QueryBuilderStateMut for QueryStateManager {
    fn set_main_table(&mut self, table: MainTable) -> Result<(), SqlError> {
        match &self.main_table {
            Some(existing) if *existing != table => Err(SqlError::MainTableConflict {
                existing: format!("{} AS {}", existing.physical_name, existing.alias),
                requested: format!("{} AS {}", table.physical_name, table.alias),
            }),
            Some(_) => Ok(()),
            None => {
                self.main_table = Some(table);
                Ok(())
            }
        }
    }

    fn set_base_cte(&mut self, name: String) {
        self.base_cte = Some(name);
    }

    fn register_cte(&mut self, field: FieldId, hint: &str, body: String) -> String {
        if let Some(existing) = self.field_ctes.get(&field) {
            return existing.clone();
        }
        let name = self.unique_name(hint);
        self.ctes.push(CteDefinition {
            name: name.clone(),
            body,
        });
        self.field_ctes.insert(field, name.clone());
        name
    }

    fn mark_cte_joined(&mut self, name: &str) {
        self.joined.insert(name.to_string());
    }

    fn set_selection(&mut self, field: FieldId, sql: String) {
        self.selections.insert(field, sql);
    }
}

// ---------------------------------------------------------------------------
// Scoped selection-only state
// ---------------------------------------------------------------------------

/// Selection-only view over a parent state.
///
/// Reads of the CTE map and main table go to the parent; selections live
/// in an isolated map dropped with the scope. Nothing is joined into a
/// nested scope, so any CTE registered by the parent resolves to the
/// direct-column fallback here.
pub struct ScopedSelectionState<'p> {
    parent: &'p dyn QueryBuilderState,
    selections: HashMap<FieldId, String>,
}

impl<'p> ScopedSelectionState<'p> {
    pub fn new(parent: &'p dyn QueryBuilderState) -> Self {
        ScopedSelectionState {
            parent,
            selections: HashMap::new(),
        }
    }

    /// Selections made inside the scope.
    pub fn local_selections(&self) -> &HashMap<FieldId, String> {
        &self.selections
    }
}

impl QueryBuilderState for ScopedSelectionState<'_> {
    fn main_table(&self) -> Option<&MainTable> {
        self.parent.main_table()
    }

    fn base_cte(&self) -> Option<&str> {
        self.parent.base_cte()
    }

    fn cte_for_field(&self, field: &FieldId) -> Option<&str> {
        self.parent.cte_for_field(field)
    }

    fn is_cte_joined(&self, _cte: &str) -> bool {
        false
    }

    fn selection(&self, field: &FieldId) -> Option<&str> {
        self.selections.get(field).map(String::as_str)
    }
}

impl QueryBuilderStateMut for ScopedSelectionState<'_> {
    fn set_main_table(&mut self, _table: MainTable) -> Result<(), SqlError> {
        panic!("ScopedSelectionState is read-only: cannot set the main table");
    }

    fn set_base_cte(&mut self, _name: String) {
        panic!("ScopedSelectionState is read-only: cannot set the base CTE");
    }

    fn register_cte(&mut self, _field: FieldId, _hint: &str, _body: String) -> String {
        panic!("ScopedSelectionState is read-only: cannot register a CTE");
    }

    fn mark_cte_joined(&mut self, _name: &str) {
        panic!("ScopedSelectionState is read-only: cannot join a CTE");
    }

    fn set_selection(&mut self, field: FieldId, sql: String) {
        self.selections.insert(field, sql);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(c: char) -> FieldId {
        FieldId::parse(format!("fld{}", c.to_string().repeat(16))).unwrap()
    }

    fn main(alias: &str) -> MainTable {
        MainTable {
            alias: alias.to_string(),
            physical_name: "tblAAAAAAAAAAAAAAAA".to_string(),
        }
    }

    #[test]
    fn main_table_is_captured_once() {
        let mut state = QueryStateManager::new();
        state.set_main_table(main("t")).unwrap();
        state.set_main_table(main("t")).unwrap();
        assert!(matches!(
            state.set_main_table(main("other")),
            Err(SqlError::MainTableConflict { .. })
        ));
    }

    #[test]
    fn registering_a_field_twice_reuses_the_cte() {
        let mut state = QueryStateManager::new();
        let a = state.register_cte(fid('A'), "lookup", "SELECT 1".into());
        let again = state.register_cte(fid('A'), "lookup", "SELECT 2".into());
        let b = state.register_cte(fid('B'), "lookup", "SELECT 3".into());
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(state.cte_definitions().len(), 2);
        assert_eq!(state.joined_ctes().count(), 0);
    }

    #[test]
    fn scoped_selections_do_not_leak() {
        let mut parent = QueryStateManager::new();
        let cte = parent.register_cte(fid('A'), "a", "SELECT 1".into());
        parent.mark_cte_joined(&cte);
        {
            let mut scoped = ScopedSelectionState::new(&parent);
            scoped.set_selection(fid('B'), "\"f\".\"b\"".into());
            assert_eq!(scoped.cte_for_field(&fid('A')), Some(cte.as_str()));
            assert!(!scoped.is_cte_joined(&cte));
            assert_eq!(scoped.local_selections().len(), 1);
        }
        assert_eq!(parent.selection(&fid('B')), None);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn scoped_cte_registration_panics() {
        let parent = QueryStateManager::new();
        let mut scoped = ScopedSelectionState::new(&parent);
        scoped.register_cte(fid('A'), "a", String::new());
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn scoped_main_table_write_panics() {
        let parent = QueryStateManager::new();
        let mut scoped = ScopedSelectionState::new(&parent);
        let _ = scoped.set_main_table(main("t"));
    }
}
