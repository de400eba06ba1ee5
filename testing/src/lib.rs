//! # Idempotency Testing
//!
//! Testing utilities for idempotent request execution.
//!
//! This crate provides:
//! - [`InMemoryKeyStore`]: a serializable, fault-injectable key store
//! - Controllable clocks ([`FixedClock`], [`MockClock`])
//! - Stage mocks that count calls, fail on demand or block until released
//! - proptest strategies for request parameters
//!
//! ## Example
//!
//! ```ignore
//! use idempotency_testing::{InMemoryKeyStore, MockClock, RecordingStage};
//!
//! #[tokio::test]
//! async fn retry_runs_stage_once() {
//!     let store = InMemoryKeyStore::new();
//!     let charge = RecordingStage::new("charge_created");
//!     let orchestrator = Orchestrator::new(store.clone(), MockClock::default());
//!
//!     orchestrator.execute(request(), &operation(&charge)).await?;
//!     orchestrator.execute(request(), &operation(&charge)).await?;
//!
//!     assert_eq!(charge.calls(), 1);
//! }
//! ```

use chrono::{DateTime, Utc};
use idempotency_core::environment::Clock;

/// In-memory key store
pub mod key_store_mocks;

/// Stage mocks
pub mod stage_mocks;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::Duration;
    use std::sync::{Arc, PoisonError, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use idempotency_testing::mocks::FixedClock;
    /// use idempotency_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// The instant every test clock starts at: 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// A clock tests can move forward.
    ///
    /// Clones share the same time, so a test can keep a handle while the
    /// orchestrator owns another.
    ///
    /// # Example
    ///
    /// ```
    /// use idempotency_testing::mocks::MockClock;
    /// use idempotency_core::environment::Clock;
    /// use chrono::Duration;
    ///
    /// let clock = MockClock::default();
    /// let before = clock.now();
    /// clock.advance(Duration::seconds(91));
    /// assert_eq!(clock.now() - before, Duration::seconds(91));
    /// ```
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Default for MockClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Honors `RUST_LOG`. Safe to call from every test; only the first call
    /// installs anything.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Scalar JSON values.
    pub fn json_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    /// Request parameters: a JSON object nested up to three levels.
    pub fn request_params() -> impl Strategy<Value = Value> {
        let leaf = json_scalar();
        let value = leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>())),
            ]
        });
        prop::collection::btree_map("[a-z_]{1,8}", value, 0..5)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    /// Idempotency tokens within the storage limits.
    pub fn token() -> impl Strategy<Value = String> {
        "[A-Za-z0-9-]{1,40}"
    }
}

// Re-export commonly used items
pub use key_store_mocks::{InMemoryKeyStore, InMemoryTransaction, TransactionCounts};
pub use mocks::{FixedClock, MockClock, test_clock, test_epoch};
pub use stage_mocks::{CallLog, GatedStage, RecordingStage, StageGate};
