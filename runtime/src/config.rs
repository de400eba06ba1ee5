//! Orchestrator configuration.

use chrono::Duration;
use idempotency_core::lock::DEFAULT_LOCK_TIMEOUT_SECS;
use std::env;

/// Configuration for an [`Orchestrator`](crate::Orchestrator).
///
/// # Example
///
/// ```
/// use idempotency_runtime::IdempotencyConfig;
/// use chrono::Duration;
///
/// let config = IdempotencyConfig::new()
///     .with_lock_timeout(Duration::seconds(30))
///     .with_release_lock_on_stage_failure(true);
/// assert_eq!(config.lock_timeout, Duration::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// Age after which a held lock counts as abandoned and may be stolen.
    ///
    /// Must be positive; [`with_lock_timeout`](Self::with_lock_timeout) and
    /// [`from_env`](Self::from_env) reject anything else.
    pub lock_timeout: Duration,

    /// Clear the lock when a stage or the responder fails.
    ///
    /// Off by default: a failed attempt keeps the key locked until the
    /// timeout, and only then can a retry resume it.
    pub release_lock_on_stage_failure: bool,
}

impl IdempotencyConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock_timeout: Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
            release_lock_on_stage_failure: false,
        }
    }

    /// Set the lock timeout.
    ///
    /// A zero or negative timeout would make every held lock stale at once;
    /// it is ignored and the current value kept.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        if timeout > Duration::zero() {
            self.lock_timeout = timeout;
        } else {
            tracing::warn!(?timeout, "Ignoring non-positive lock timeout");
        }
        self
    }

    /// Release the lock when an attempt fails.
    #[must_use]
    pub const fn with_release_lock_on_stage_failure(mut self, release: bool) -> Self {
        self.release_lock_on_stage_failure = release;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to the defaults.
    ///
    /// - `IDEMPOTENCY_LOCK_TIMEOUT_SECS` (default 90; must be positive)
    /// - `IDEMPOTENCY_RELEASE_LOCK_ON_FAILURE` (default false)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::new();

        Self {
            lock_timeout: parse_lock_timeout(env::var("IDEMPOTENCY_LOCK_TIMEOUT_SECS").ok())
                .unwrap_or(defaults.lock_timeout),
            release_lock_on_stage_failure: env::var("IDEMPOTENCY_RELEASE_LOCK_ON_FAILURE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.release_lock_on_stage_failure),
        }
    }
}

/// Seconds from the environment, if they form a positive, representable timeout.
fn parse_lock_timeout(raw: Option<String>) -> Option<Duration> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(Duration::try_seconds)
        .filter(|timeout| *timeout > Duration::zero())
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_lock_controller() {
        let config = IdempotencyConfig::default();
        assert_eq!(config.lock_timeout, Duration::seconds(90));
        assert!(!config.release_lock_on_stage_failure);
    }

    #[test]
    fn builders_override_fields() {
        let config = IdempotencyConfig::new()
            .with_lock_timeout(Duration::seconds(5))
            .with_release_lock_on_stage_failure(true);

        assert_eq!(config.lock_timeout, Duration::seconds(5));
        assert!(config.release_lock_on_stage_failure);
    }

    #[test]
    fn lock_timeout_must_be_positive() {
        assert_eq!(parse_lock_timeout(Some("30".to_string())), Some(Duration::seconds(30)));
        assert_eq!(parse_lock_timeout(Some("-5".to_string())), None);
        assert_eq!(parse_lock_timeout(Some("0".to_string())), None);
        assert_eq!(parse_lock_timeout(Some("soon".to_string())), None);
        assert_eq!(parse_lock_timeout(None), None);
    }

    #[test]
    fn oversized_lock_timeout_falls_back() {
        assert_eq!(parse_lock_timeout(Some(i64::MAX.to_string())), None);
    }

    #[test]
    fn builder_ignores_non_positive_timeout() {
        let config = IdempotencyConfig::new().with_lock_timeout(Duration::seconds(-5));
        assert_eq!(config.lock_timeout, Duration::seconds(90));

        let config = IdempotencyConfig::new().with_lock_timeout(Duration::zero());
        assert_eq!(config.lock_timeout, Duration::seconds(90));
    }
}
