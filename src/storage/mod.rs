//! SQLite storage layer.
//!
//! - WAL mode, foreign keys on, one connection per store
//! - Transaction discipline for writes, with history rows in the same commit
//! - Versioned migrations applied before a store serves anything
//!
//! # Submodules
//!
//! - [`store`] - The `Store` API
//! - [`migrations`] - Migration registry and engines
//! - [`history`] - Update history rows
//! - [`search`] - FTS5 shadow index
//! - [`retry`] - Backoff for busy/locked writes

pub mod history;
pub mod migrations;
pub mod retry;
pub mod search;
pub mod store;

pub use history::{Action, HistoryEntry, MutationContext};
pub use migrations::{MigrationStatus, Migrator, SafeMigrator, SchemaReport};
pub use retry::RetryPolicy;
pub use store::Store;
