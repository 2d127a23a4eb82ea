//! Outbox storage crate - SQLite persistence for the action queue.
//!
//! Provides a WAL-mode SQLite database with migrations, the action store
//! used by producers and the dispatcher, live per-entity observers, and
//! retention sweeps for terminal records.

pub mod db;
pub mod migrations;
pub mod observe;
pub mod retention;
pub mod store;

pub use db::Database;
pub use observe::{EntityObserver, StoreChange};
pub use retention::{RetentionManager, RetentionResult};
pub use store::{ActionStore, StatusCounts};
