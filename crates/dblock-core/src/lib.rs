//! Lease-based mutual-exclusion lock over a shared relational store.
//!
//! This crate holds the lock protocol itself, independent of any database:
//! - `DbLock`: the per-process handle with `hold()` and `release()`
//! - `LockStore`: the statements a backing store must provide
//! - `MemoryLockStore`: an in-process store with the same semantics
//!
//! Competing processes each create their own `DbLock` against the same lock
//! name. The store's atomic conditional updates decide who wins; no other
//! coordination is needed.

mod config;
mod error;
mod handle;
mod memory;
mod store;

pub use config::{LockConfig, MAX_RENEW_INTERVAL};
pub use error::LockError;
pub use handle::{DbLock, LockState};
pub use memory::{MemoryLockStore, MemoryRow};
pub use store::LockStore;

pub use tokio_util::sync::CancellationToken;
