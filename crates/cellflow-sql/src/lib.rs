//! SQL compilation of computed fields.
//!
//! Computed fields are read *fresh* by compiling them to SQL expressions
//! over the physical record tables:
//!
//! - [`dialect`]: quoting, JSON and date rendering per backend.
//! - [`state`]: query-builder state shared through one compilation.
//! - [`source`]: the uniform row source behind every link-based read.
//! - [`cte`]: grouped CTEs for link, lookup and rollup fields.
//! - [`compiler`]: the per-field selection visitor.
//! - [`query`]: full record queries with parameters.

pub mod compiler;
pub mod cte;
pub mod dialect;
pub mod error;
pub mod query;
pub mod source;
pub mod state;

pub use compiler::FieldSelectCompiler;
pub use cte::LinkCteBuilder;
pub use dialect::{DialectProvider, PostgresDialect, SqliteDialect};
pub use error::SqlError;
pub use query::{CompiledQuery, CteStrategy, RecordQueryBuilder};
pub use state::{QueryBuilderState, QueryBuilderStateMut, QueryStateManager, ScopedSelectionState};
