use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::LockError;
use crate::store::LockStore;

/// Where a handle stands.
///
/// `Failed` is absorbing: once a handle fails it returns the same error from
/// every later `hold()` and never contacts the store again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// The lease was claimed or renewed at `last_claim`.
    Held { last_claim: Instant },
    /// The handle lost, never obtained, or released the lock.
    Failed(LockError),
}

/// A claim on one named lock.
///
/// Created by [`DbLock::acquire`], which performs the initial claim. Drive it
/// by calling [`hold`](DbLock::hold) on a timer for as long as the protected
/// work runs, and call [`release`](DbLock::release) when the work ends.
/// Dropping the handle does not release the lock; the lease simply runs out.
pub struct DbLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    cancel: CancellationToken,
    token: i64,
    state: LockState,
}

impl DbLock {
    /// Claim the lock named in `config`.
    ///
    /// Never fails: any error is latched on the returned handle and reported
    /// by the first `hold()`.
    pub async fn acquire(
        cancel: CancellationToken,
        store: Arc<dyn LockStore>,
        config: LockConfig,
    ) -> Self {
        let token = new_token();
        let state = match initialize(store.as_ref(), &config, token).await {
            Ok(()) => {
                info!(
                    lock = %config.name,
                    token,
                    backend = store.backend_name(),
                    lease_ms = config.lease.as_millis() as u64,
                    "Acquired lock"
                );
                LockState::Held {
                    last_claim: Instant::now(),
                }
            }
            Err(err) => {
                info!(lock = %config.name, token, error = %err, "Could not acquire lock");
                LockState::Failed(err)
            }
        };

        Self {
            store,
            config,
            cancel,
            token,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn state(&self) -> &LockState {
        &self.state
    }

    /// Whether the last operation left this handle holding the lock.
    ///
    /// The lease may still have expired since; only `hold()` confirms it.
    pub fn is_held(&self) -> bool {
        matches!(self.state, LockState::Held { .. })
    }

    /// Acquire, confirm or renew ownership.
    ///
    /// Contacts the store at most once per renewal interval. Any failure is
    /// latched; the caller must stop the protected work on `Err`.
    pub async fn hold(&mut self) -> Result<(), LockError> {
        if let LockState::Failed(err) = &self.state {
            return Err(err.clone());
        }

        if self.cancel.is_cancelled() {
            // Best effort: the caller is going away either way.
            if let Err(err) = self.release_held().await {
                debug!(lock = %self.config.name, error = %err, "Release after cancellation failed");
            }
            return Err(self.latch(LockError::Cancelled {
                name: self.config.name.clone(),
            }));
        }

        self.confirm().await
    }

    /// Give up the lock by dropping its table.
    ///
    /// Safe to call unconditionally: a handle that does not hold the lock
    /// (never did, lost it, or already released it) returns `Ok(())` without
    /// touching the store. Only a failure to drop a table this handle owns is
    /// reported.
    pub async fn release(&mut self) -> Result<(), LockError> {
        if let LockState::Failed(err) = &self.state {
            if err.is_invariant_violation() {
                warn!(lock = %self.config.name, error = %err, "Skipping release of a corrupted lock");
            } else {
                debug!(lock = %self.config.name, error = %err, "Nothing to release");
            }
            return Ok(());
        }

        if let Err(err) = self.hold().await {
            debug!(lock = %self.config.name, error = %err, "Lock is no longer ours, nothing to release");
            return Ok(());
        }

        self.drop_table().await
    }

    /// Rate-limited ownership check; skips the cancellation check.
    async fn confirm(&mut self) -> Result<(), LockError> {
        let LockState::Held { last_claim } = self.state else {
            return Err(self.latched());
        };
        if last_claim.elapsed() < self.config.renew_interval() {
            return Ok(());
        }

        let result = self
            .store
            .renew_or_claim(&self.config.name, self.token, self.config.lease)
            .await
            .and_then(|affected| check_affected(&self.config.name, affected));

        match result {
            Ok(()) => {
                debug!(lock = %self.config.name, token = self.token, "Renewed lock");
                self.state = LockState::Held {
                    last_claim: Instant::now(),
                };
                Ok(())
            }
            Err(err) => {
                warn!(lock = %self.config.name, token = self.token, error = %err, "Lost lock");
                Err(self.latch(err))
            }
        }
    }

    async fn release_held(&mut self) -> Result<(), LockError> {
        self.confirm().await?;
        self.drop_table().await
    }

    async fn drop_table(&mut self) -> Result<(), LockError> {
        match self.store.drop_table(&self.config.name).await {
            Ok(()) => {
                info!(lock = %self.config.name, token = self.token, "Released lock");
                self.state = LockState::Failed(LockError::Released {
                    name: self.config.name.clone(),
                });
                Ok(())
            }
            Err(err) => Err(self.latch(LockError::store(
                format!("failed to release lock {}", self.config.name),
                err,
            ))),
        }
    }

    fn latch(&mut self, err: LockError) -> LockError {
        self.state = LockState::Failed(err.clone());
        err
    }

    fn latched(&self) -> LockError {
        match &self.state {
            LockState::Failed(err) => err.clone(),
            LockState::Held { .. } => LockError::Released {
                name: self.config.name.clone(),
            },
        }
    }
}

/// Random, non-negative claim identity.
fn new_token() -> i64 {
    (rand::random::<u64>() >> 1) as i64
}

async fn initialize(
    store: &dyn LockStore,
    config: &LockConfig,
    token: i64,
) -> Result<(), LockError> {
    config.validate()?;
    let name = config.name.as_str();

    store.ensure_table(name).await?;
    let affected = match store.count_rows(name).await? {
        0 => store.insert_claim(name, token, config.lease).await?,
        1 => store.claim_expired(name, token, config.lease).await?,
        rows => {
            return Err(LockError::InvariantViolation {
                name: name.to_string(),
                detail: format!("found {rows} rows on init, expected at most 1"),
            });
        }
    };
    check_affected(name, affected)
}

fn check_affected(name: &str, affected: u64) -> Result<(), LockError> {
    match affected {
        1 => Ok(()),
        0 => Err(LockError::Refused {
            name: name.to_string(),
        }),
        n => Err(LockError::InvariantViolation {
            name: name.to_string(),
            detail: format!("claim affected {n} rows, expected 1"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::{MemoryLockStore, MemoryRow};

    const LEASE: Duration = Duration::from_millis(40);
    const TABLE: &str = "some_test_lock";

    fn setup() -> (Arc<MemoryLockStore>, CancellationToken) {
        (Arc::new(MemoryLockStore::new()), CancellationToken::new())
    }

    async fn lock(store: &Arc<MemoryLockStore>, cancel: &CancellationToken) -> DbLock {
        DbLock::acquire(
            cancel.clone(),
            store.clone(),
            LockConfig::new(TABLE, LEASE),
        )
        .await
    }

    async fn sleep(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_creates_single_row() {
        let (store, cancel) = setup();
        let mut first = lock(&store, &cancel).await;

        first.hold().await.unwrap();
        assert!(first.is_held());
        let rows = store.rows(TABLE).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].token, Some(first.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion_and_takeover() {
        let (store, cancel) = setup();
        let mut first = lock(&store, &cancel).await;
        first.hold().await.unwrap();

        sleep(20).await;
        let mut second = lock(&store, &cancel).await;
        let err = second.hold().await.unwrap_err();
        assert!(err.is_refused(), "{err}");
        second.release().await.unwrap();
        assert!(store.table_exists(TABLE));

        // First lease expired at 40ms
        sleep(30).await;
        let mut second = lock(&store, &cancel).await;
        second.hold().await.unwrap();

        let err = first.hold().await.unwrap_err();
        assert!(err.is_refused(), "{err}");

        // Releasing a lost lock is a no-op and leaves the new owner's table
        first.release().await.unwrap();
        let rows = store.rows(TABLE).unwrap();
        assert_eq!(rows[0].token, Some(second.token()));

        second.release().await.unwrap();
        assert!(!store.table_exists(TABLE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let store = Arc::new(MemoryLockStore::new());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let config = LockConfig::new(TABLE, Duration::from_secs(30));
                    let mut handle = DbLock::acquire(CancellationToken::new(), store, config).await;
                    handle.hold().await.is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.rows(TABLE).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_within_renew_interval_skips_store() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;

        store.set_unavailable(true);
        for _ in 0..5 {
            sleep(4).await;
            handle.hold().await.unwrap();
        }

        // 25ms renew interval has now passed
        sleep(10).await;
        let err = handle.hold().await.unwrap_err();
        assert!(matches!(err, LockError::Store { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_competitors_out() {
        let (store, cancel) = setup();
        let mut owner = lock(&store, &cancel).await;

        for _ in 0..10 {
            sleep(30).await;
            owner.hold().await.unwrap();

            let mut rival = lock(&store, &cancel).await;
            assert!(rival.hold().await.unwrap_err().is_refused());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_reclaimed_by_same_handle() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;

        sleep(100).await;
        handle.hold().await.unwrap();
        assert!(handle.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_and_latches() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;
        handle.hold().await.unwrap();

        cancel.cancel();
        let err = handle.hold().await.unwrap_err();
        assert!(err.is_cancelled(), "{err}");
        assert!(!store.table_exists(TABLE));

        sleep(100).await;
        assert!(handle.hold().await.unwrap_err().is_cancelled());
        handle.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_of_refused_handle_keeps_owner() {
        let (store, cancel) = setup();
        let mut owner = lock(&store, &cancel).await;

        let other_cancel = CancellationToken::new();
        let mut rival = lock(&store, &other_cancel).await;
        other_cancel.cancel();
        assert!(rival.hold().await.unwrap_err().is_refused());

        owner.hold().await.unwrap();
        assert!(store.table_exists(TABLE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_idempotent() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;

        handle.release().await.unwrap();
        assert!(!store.table_exists(TABLE));
        handle.release().await.unwrap();

        let err = handle.hold().await.unwrap_err();
        assert!(matches!(err, LockError::Released { .. }));

        // The resource is free again
        let mut next = lock(&store, &cancel).await;
        next.hold().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_row_is_invariant_violation() {
        let (store, cancel) = setup();
        for _ in 0..2 {
            store.insert_raw_row(
                TABLE,
                MemoryRow {
                    locked_until: None,
                    token: None,
                },
            );
        }

        let mut handle = lock(&store, &cancel).await;
        let err = handle.hold().await.unwrap_err();
        assert!(err.is_invariant_violation(), "{err}");
        handle.release().await.unwrap();
        assert_eq!(store.rows(TABLE).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_added_while_held_is_invariant_violation() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;
        let token = handle.token();

        store.insert_raw_row(
            TABLE,
            MemoryRow {
                locked_until: None,
                token: Some(token),
            },
        );
        sleep(30).await;
        assert!(handle.hold().await.unwrap_err().is_invariant_violation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_on_init_is_latched() {
        let (store, cancel) = setup();
        store.set_unavailable(true);
        let mut handle = lock(&store, &cancel).await;

        store.set_unavailable(false);
        let err = handle.hold().await.unwrap_err();
        assert!(matches!(err, LockError::Store { .. }));
        assert_eq!(handle.hold().await.unwrap_err(), err);
        handle.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_never_heals() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;

        store.set_unavailable(true);
        sleep(30).await;
        let err = handle.hold().await.unwrap_err();

        store.set_unavailable(false);
        sleep(30).await;
        assert_eq!(handle.hold().await.unwrap_err(), err);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_drop_is_reported_once() {
        let (store, cancel) = setup();
        let mut handle = lock(&store, &cancel).await;

        // Within the renew interval, so only the drop reaches the store
        store.set_unavailable(true);
        let err = handle.release().await.unwrap_err();
        assert!(matches!(err, LockError::Store { .. }));

        store.set_unavailable(false);
        handle.release().await.unwrap();
        assert!(store.table_exists(TABLE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_name_never_reaches_store() {
        let (store, cancel) = setup();
        let mut handle = DbLock::acquire(
            cancel,
            store.clone(),
            LockConfig::new("jobs; DROP TABLE users", LEASE),
        )
        .await;

        let err = handle.hold().await.unwrap_err();
        assert!(matches!(err, LockError::InvalidConfig { .. }));
        assert!(!store.table_exists("jobs"));
        handle.release().await.unwrap();
    }

    #[test]
    fn test_tokens_are_non_negative_and_distinct() {
        let tokens: Vec<i64> = (0..64).map(|_| new_token()).collect();
        assert!(tokens.iter().all(|t| *t >= 0));
        let mut unique = tokens.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), tokens.len());
    }
}
