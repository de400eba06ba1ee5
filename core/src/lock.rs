//! Lock acquisition decisions.
//!
//! A key's lock is nothing more than its `locked_at` timestamp. A worker that
//! dies mid-operation cannot clear it, so a lock older than the timeout is
//! treated as abandoned and may be stolen. This is the crash-recovery path.
//!
//! The decision is a pure function of the key and the current time. Callers
//! must make it, and act on it, inside the same atomic phase as the
//! fingerprint check.

use crate::key::{IdempotencyKey, StoredResponse};
use chrono::{DateTime, Duration, Utc};

/// Default lock timeout in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 90;

/// Outcome of examining an existing key's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// The operation already finished; serve the stored response.
    Replay(StoredResponse),
    /// Nobody holds the lock; take it.
    Acquire,
    /// The holder exceeded the timeout; take the lock over.
    Steal {
        /// When the abandoned lock was taken
        stale_since: DateTime<Utc>,
    },
    /// Another worker holds a fresh lock; reject.
    Held {
        /// When the current owner took the lock
        locked_at: DateTime<Utc>,
    },
}

impl LockDecision {
    /// Whether the caller may proceed to execute stages.
    #[must_use]
    pub const fn may_execute(&self) -> bool {
        matches!(self, Self::Acquire | Self::Steal { .. })
    }
}

/// Decides whether a caller may take a key's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockController {
    timeout: Duration,
}

impl LockController {
    /// Create a controller with the given lock timeout.
    ///
    /// The timeout should be positive: with a zero or negative one every
    /// held lock is stale and may be stolen at once.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured lock timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a lock taken at `locked_at` is abandoned at `now`.
    ///
    /// A lock aged exactly the timeout is still held.
    #[must_use]
    pub fn is_stale(&self, locked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(locked_at) > self.timeout
    }

    /// Examine `key` at time `now`.
    #[must_use]
    pub fn decide(&self, key: &IdempotencyKey, now: DateTime<Utc>) -> LockDecision {
        if let Some(response) = key.finished_response() {
            return LockDecision::Replay(response.clone());
        }

        match key.locked_at {
            None => LockDecision::Acquire,
            Some(locked_at) if self.is_stale(locked_at, now) => LockDecision::Steal {
                stale_since: locked_at,
            },
            Some(locked_at) => LockDecision::Held { locked_at },
        }
    }
}

impl Default for LockController {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS))
    }
}
