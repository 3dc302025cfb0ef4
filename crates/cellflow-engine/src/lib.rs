//! The cellflow engine: keeps computed fields up to date.
//!
//! [`Engine`] owns a store, the schema and its dependency graph. Schema
//! changes, record writes and link changes go through it; each one is
//! followed by a propagation that recomputes the affected computed values,
//! persists those that changed and hands them to a [`ChangeNotifier`].
//! With [`PropagationMode::Outbox`], record-level propagation is deferred
//! to an [`OutboxWorker`].
//!
//! # Modules
//!
//! - [`config`]: EngineConfig and its environment variables
//! - [`error`]: EngineError
//! - [`engine`]: the Engine façade
//! - [`link`]: symmetric link fields and key storage side effects
//! - [`notify`]: change sets and notifiers
//! - [`outbox`]: deferred propagation workers
//! - [`propagation`]: triggers and the Propagator

pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod notify;
pub mod outbox;
pub mod propagation;

pub use config::{EngineConfig, PropagationMode};
pub use engine::{Engine, PRIMARY_FIELD_NAME};
pub use error::EngineError;
pub use link::{LinkSideEffect, LinkSymmetricManager};
pub use notify::{ChangeNotifier, ChangeSet, CollectingNotifier, FieldChange, TableChanges, TracingNotifier};
pub use outbox::{OutboxRunner, OutboxWorker};
pub use propagation::{CellWrite, Propagator, Trigger};
