use thiserror::Error;

/// Errors produced by a lock handle or its store.
///
/// Errors are `Clone` because a handle latches the first failure and hands the
/// same error back from every later call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another holder owns an unexpired lease.
    #[error("lock {name} refused: held by another token until its lease expires")]
    Refused { name: String },

    /// The backing table holds more than one row, or a claim touched more than one row.
    #[error("lock {name} invariant violated: {detail}")]
    InvariantViolation { name: String, detail: String },

    /// The caller's cancellation token fired.
    #[error("can't hold lock {name}: cancelled")]
    Cancelled { name: String },

    /// The handle already released the lock.
    #[error("lock {name} was released by this handle")]
    Released { name: String },

    /// The resource name or lease is unusable.
    #[error("invalid lock config for {name:?}: {reason}")]
    InvalidConfig { name: String, reason: String },

    /// A store statement failed.
    #[error("{context}: {message}")]
    Store { context: String, message: String },
}

impl LockError {
    /// Wrap a store or transport failure with the statement that caused it.
    pub fn store(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        LockError::Store {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, LockError::Refused { .. })
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, LockError::InvariantViolation { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LockError::Cancelled { .. })
    }
}
