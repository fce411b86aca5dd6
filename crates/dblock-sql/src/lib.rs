//! Relational database backend for `dblock-core` leases.
//!
//! - `SqlLockStore`: `LockStore` over a sea-orm connection
//! - `Dialect`: per-database clock expressions, column types and placeholders
//! - `StatementCache`: read-mostly cache of prepared statements

mod cache;
mod dialect;
mod store;

pub use cache::StatementCache;
pub use dialect::Dialect;
pub use store::SqlLockStore;
