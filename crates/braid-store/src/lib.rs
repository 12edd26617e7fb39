//! SQLite persistence for graph definitions and finished run ledgers.

pub mod store;

pub use store::SqliteRunStore;
