use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::error::LockError;
use crate::store::LockStore;

/// One row of an in-memory lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRow {
    pub locked_until: Option<Instant>,
    pub token: Option<i64>,
}

/// In-process lock store with the same conditional semantics as the SQL store.
///
/// All handles sharing one `MemoryLockStore` compete exactly as processes
/// sharing one database would. The mutex plays the role of the database's
/// row-level serialization. Time comes from `tokio::time`, so tests can pause
/// and advance the clock.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    tables: Mutex<HashMap<String, Vec<MemoryRow>>>,
    unavailable: Mutex<bool>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = unavailable;
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.tables().contains_key(table)
    }

    /// Rows of a table, or `None` if the table doesn't exist.
    pub fn rows(&self, table: &str) -> Option<Vec<MemoryRow>> {
        self.tables().get(table).cloned()
    }

    /// Insert a row unconditionally, creating the table if needed.
    ///
    /// Models an operator writing to the lock table by hand.
    pub fn insert_raw_row(&self, table: &str, row: MemoryRow) {
        self.tables().entry(table.to_string()).or_default().push(row);
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Vec<MemoryRow>>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self, context: &str) -> Result<(), LockError> {
        if *self
            .unavailable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(LockError::store(context, "connection refused"));
        }
        Ok(())
    }

    /// Apply a conditional claim to every row matching `predicate`.
    fn update_where(
        &self,
        context: &str,
        table: &str,
        token: i64,
        lease: Duration,
        predicate: impl Fn(&MemoryRow, Instant) -> bool,
    ) -> Result<u64, LockError> {
        self.check_available(context)?;
        let now = Instant::now();
        let mut tables = self.tables();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| LockError::store(context, format!("table {table} does not exist")))?;

        let mut affected = 0;
        for row in rows.iter_mut() {
            if predicate(row, now) {
                row.token = Some(token);
                row.locked_until = Some(now + lease);
                affected += 1;
            }
        }
        debug!(table, token, affected, "Conditional claim applied");
        Ok(affected)
    }
}

/// `locked_until < now`; a NULL expiry never compares true, as in SQL.
fn expired(row: &MemoryRow, now: Instant) -> bool {
    row.locked_until.is_some_and(|until| until < now)
}

#[async_trait]
impl LockStore for MemoryLockStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn ensure_table(&self, table: &str) -> Result<(), LockError> {
        self.check_available("failed to create lock table")?;
        self.tables().entry(table.to_string()).or_default();
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_rows(&self, table: &str) -> Result<u64, LockError> {
        let context = "failed to count lock rows";
        self.check_available(context)?;
        self.tables()
            .get(table)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| LockError::store(context, format!("table {table} does not exist")))
    }

    #[instrument(skip(self), level = "debug")]
    async fn insert_claim(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        let context = "failed to insert lock row";
        self.check_available(context)?;
        let mut tables = self.tables();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| LockError::store(context, format!("table {table} does not exist")))?;
        // Someone else inserted first
        if !rows.is_empty() {
            return Ok(0);
        }
        rows.push(MemoryRow {
            locked_until: Some(Instant::now() + lease),
            token: Some(token),
        });
        Ok(1)
    }

    #[instrument(skip(self), level = "debug")]
    async fn claim_expired(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        self.update_where("failed to claim expired lock", table, token, lease, expired)
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew_or_claim(
        &self,
        table: &str,
        token: i64,
        lease: Duration,
    ) -> Result<u64, LockError> {
        self.update_where("failed to renew lock", table, token, lease, |row, now| {
            expired(row, now) || row.token == Some(token)
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn drop_table(&self, table: &str) -> Result<(), LockError> {
        self.check_available("failed to drop lock table")?;
        self.tables().remove(table);
        Ok(())
    }
}
