use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

/// Storage abstraction behind a lock handle.
///
/// Each lock lives in its own table named after the lock, holding at most one
/// row `(locked_until, token)`. Every method maps to a single statement, and
/// the two claim methods are conditional updates whose predicate is evaluated
/// atomically by the store against the store's own clock.
///
/// The claim methods return the number of affected rows; interpreting that
/// count is the handle's job.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Short identifier used in logs (e.g. "postgres", "memory").
    fn backend_name(&self) -> &'static str;

    /// Create the lock table if it does not exist yet.
    async fn ensure_table(&self, table: &str) -> Result<(), LockError>;

    /// Number of rows currently in the lock table.
    async fn count_rows(&self, table: &str) -> Result<u64, LockError>;

    /// Insert the first row: `token`, expiring `lease` from now.
    async fn insert_claim(&self, table: &str, token: i64, lease: Duration)
        -> Result<u64, LockError>;

    /// Take over the row only where its lease already expired.
    async fn claim_expired(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError>;

    /// Extend the lease where it expired or is already owned by `token`.
    async fn renew_or_claim(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError>;

    /// Drop the lock table; succeeds if it is already gone.
    async fn drop_table(&self, table: &str) -> Result<(), LockError>;
}
