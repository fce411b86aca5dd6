use std::time::Duration;

use crate::error::LockError;

/// Upper bound on the renewal interval, so long leases still renew often.
pub const MAX_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Longest identifier accepted by every supported database.
const MAX_NAME_LEN: usize = 63;

/// Configuration for one named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Resource name; doubles as the backing table name.
    pub name: String,
    /// Lease duration granted by each successful claim.
    pub lease: Duration,
}

impl LockConfig {
    pub fn new(name: impl Into<String>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            lease,
        }
    }

    /// Minimum time between two store round trips in `hold()`.
    ///
    /// Five eighths of the lease, capped at [`MAX_RENEW_INTERVAL`].
    pub fn renew_interval(&self) -> Duration {
        (self.lease * 5 / 8).min(MAX_RENEW_INTERVAL)
    }

    /// Check that the name is safe to interpolate into DDL.
    pub fn validate(&self) -> Result<(), LockError> {
        let invalid = |reason: &str| LockError::InvalidConfig {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        let mut chars = self.name.chars();
        match chars.next() {
            None => return Err(invalid("name is empty")),
            Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
                return Err(invalid("must start with an ASCII letter or underscore"));
            }
            Some(_) => {}
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(invalid("longer than 63 bytes"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid("only ASCII letters, digits and underscores are allowed"));
        }
        if self.lease.is_zero() {
            return Err(invalid("lease must be longer than zero"));
        }
        Ok(())
    }
}
