//! # Idempotency Core
//!
//! Core traits and types for exactly-once execution of side-effecting API
//! requests using idempotency keys.
//!
//! A client may send the same logical request several times (timeouts, proxy
//! retries, double clicks). Each request carries a client-chosen token; the
//! `(caller, token)` pair identifies a persisted [`IdempotencyKey`] that
//! records what the request looked like, how far its execution got, and the
//! final response once there is one.
//!
//! ## Core Concepts
//!
//! - **Key**: The persisted record ([`key::IdempotencyKey`])
//! - **Fingerprint**: Canonical form of the request parameters ([`fingerprint::Fingerprint`])
//! - **Lock**: The `locked_at` timestamp, interpreted by [`lock::LockController`]
//! - **Recovery point**: The last completed stage ([`key::RecoveryPoint`])
//! - **Stage**: One side effect of a multi-stage operation ([`stage::Stage`])
//! - **Key store**: Transactional storage capability ([`key_store::KeyStore`])
//!
//! This crate holds no I/O. The runtime crate drives the protocol, backend
//! crates implement [`key_store::KeyStore`].
//!
//! ## Example
//!
//! ```
//! use idempotency_core::fingerprint::Fingerprint;
//! use serde_json::json;
//!
//! let first = Fingerprint::from_params(&json!({"origin": "A", "target": "B"}));
//! let retry = Fingerprint::from_params(&json!({"target": "B", "origin": "A"}));
//! assert!(first.matches(&retry));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Error taxonomy for idempotent execution
pub mod error;

/// Canonical request fingerprints
pub mod fingerprint;

/// The idempotency key record and its recovery point
pub mod key;

/// Storage capability traits
pub mod key_store;

/// Lock acquisition decisions
pub mod lock;

/// Operations: ordered stage sequences plus a responder
pub mod operation;

/// Incoming requests and their validation
pub mod request;

/// Stage trait and execution context
pub mod stage;

/// Environment module - Dependency injection traits
///
/// All time-dependent decisions (lock acquisition, staleness) read the
/// current time through [`Clock`](environment::Clock) so tests can pin or
/// advance it.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use error::{IdempotencyError, StageError};
pub use fingerprint::Fingerprint;
pub use key::{IdempotencyKey, KeyId, NewKey, RecoveryPoint, StoredResponse};
pub use request::IdempotentRequest;
pub use key_store::{KeyStore, KeyTransaction, StorageError};
pub use lock::{LockController, LockDecision};
pub use operation::{Operation, OperationBuilder, Responder, StageSequence};
pub use stage::{FnStage, Stage, StageContext, stage};

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
