//! The idempotency key record.
//!
//! One [`IdempotencyKey`] exists per `(caller_id, idempotency_token)` pair. It
//! is created the first time the pair is seen, inside the same transaction
//! that takes the lock, and is then only mutated by the worker holding that
//! lock. The core never deletes keys; retention is an external policy.
//!
//! # Invariants
//!
//! - `(caller_id, idempotency_token)` is unique
//! - `request_fingerprint` never changes after creation
//! - `response` is `Some` exactly when `recovery_point` is [`RecoveryPoint::Finished`]
//! - `locked_at` is `Some` only while a worker executes (or until it goes stale)

use crate::fingerprint::Fingerprint;
use crate::key_store::StorageError;
use crate::request::IdempotentRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Maximum length of a recovery point name, matching the storage column.
pub const MAX_RECOVERY_POINT_LEN: usize = 50;

/// Lowest status code a stored response may carry.
pub const MIN_RESPONSE_CODE: u16 = 100;

/// Highest status code a stored response may carry.
pub const MAX_RESPONSE_CODE: u16 = 599;

/// Unique identifier of a stored idempotency key.
///
/// Assigned by the key store on creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(i64);

impl KeyId {
    /// Create a key ID from its storage representation.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the storage representation.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How far the operation guarded by a key has progressed.
///
/// Stored as a plain string: the two sentinels `"started"` and `"finished"`,
/// or the name of the last stage that completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecoveryPoint {
    /// No stage has completed yet
    Started,
    /// The named stage is the last one that completed
    Stage(String),
    /// A final response has been stored
    Finished,
}

impl RecoveryPoint {
    /// Storage value of [`RecoveryPoint::Started`].
    pub const STARTED: &'static str = "started";

    /// Storage value of [`RecoveryPoint::Finished`].
    pub const FINISHED: &'static str = "finished";

    /// Recovery point recorded after the named stage completes.
    #[must_use]
    pub fn stage(name: impl Into<String>) -> Self {
        Self::Stage(name.into())
    }

    /// Convert to the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Started => Self::STARTED,
            Self::Stage(name) => name,
            Self::Finished => Self::FINISHED,
        }
    }

    /// Parse from the database string representation.
    ///
    /// Any value other than the two sentinels names a stage.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            Self::STARTED => Self::Started,
            Self::FINISHED => Self::Finished,
            stage => Self::Stage(stage.to_string()),
        }
    }

    /// Whether `name` collides with one of the sentinel values.
    #[must_use]
    pub fn is_sentinel(name: &str) -> bool {
        name == Self::STARTED || name == Self::FINISHED
    }

    /// Whether the operation has produced its final response.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final response of an operation, replayed verbatim to every duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP-equivalent status code
    pub code: u16,
    /// Response body
    pub body: Value,
}

impl StoredResponse {
    /// Create a response with an explicit status code.
    #[must_use]
    pub const fn new(code: u16, body: Value) -> Self {
        Self { code, body }
    }

    /// Create a `200` response.
    #[must_use]
    pub const fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// Whether the code is an HTTP status code (100 to 599).
    #[must_use]
    pub const fn has_valid_code(&self) -> bool {
        self.code >= MIN_RESPONSE_CODE && self.code <= MAX_RESPONSE_CODE
    }
}

/// A persisted idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyKey {
    /// Identity assigned on creation
    pub id: KeyId,
    /// When the key was first seen
    pub created_at: DateTime<Utc>,
    /// Principal that sent the request
    pub caller_id: String,
    /// Client-supplied token, unique per caller
    pub idempotency_token: String,
    /// Request method (diagnostic)
    pub request_method: String,
    /// Request path (diagnostic)
    pub request_path: String,
    /// Canonical request parameters recorded at creation
    pub request_fingerprint: Fingerprint,
    /// When the current owner took the lock, if anyone holds it
    pub locked_at: Option<DateTime<Utc>>,
    /// When a worker last (re)acquired the key
    pub last_run_at: DateTime<Utc>,
    /// Progress of the guarded operation
    pub recovery_point: RecoveryPoint,
    /// Final response, set together with [`RecoveryPoint::Finished`]
    pub response: Option<StoredResponse>,
}

impl IdempotencyKey {
    /// The stored response, if the operation has finished.
    #[must_use]
    pub fn finished_response(&self) -> Option<&StoredResponse> {
        if self.recovery_point.is_finished() {
            self.response.as_ref()
        } else {
            None
        }
    }

    /// Whether some worker currently holds (or held, if stale) the lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    /// Check the response/recovery-point invariant of a loaded record.
    ///
    /// Backends call this before handing a row to the core.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupt`] if a response is stored without the
    /// key being finished, or the key is finished without a response.
    pub fn validate(&self) -> Result<(), StorageError> {
        match (&self.recovery_point, &self.response) {
            (RecoveryPoint::Finished, None) => Err(StorageError::Corrupt(format!(
                "key {} is finished but has no stored response",
                self.id
            ))),
            (point, Some(_)) if !point.is_finished() => Err(StorageError::Corrupt(format!(
                "key {} stores a response at recovery point '{point}'",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Data needed to insert a key the first time a `(caller, token)` is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    /// Principal that sent the request
    pub caller_id: String,
    /// Client-supplied token
    pub idempotency_token: String,
    /// Request method
    pub request_method: String,
    /// Request path
    pub request_path: String,
    /// Canonical request parameters
    pub request_fingerprint: Fingerprint,
}

impl NewKey {
    /// Build the insert payload for a request.
    #[must_use]
    pub fn from_request(request: &IdempotentRequest) -> Self {
        Self {
            caller_id: request.caller_id.clone(),
            idempotency_token: request.idempotency_token.clone(),
            request_method: request.method.clone(),
            request_path: request.path.clone(),
            request_fingerprint: request.fingerprint(),
        }
    }

    /// Materialize the record a store inserts: started, locked and run at `now`.
    #[must_use]
    pub fn into_key(self, id: KeyId, now: DateTime<Utc>) -> IdempotencyKey {
        IdempotencyKey {
            id,
            created_at: now,
            caller_id: self.caller_id,
            idempotency_token: self.idempotency_token,
            request_method: self.request_method,
            request_path: self.request_path,
            request_fingerprint: self.request_fingerprint,
            locked_at: Some(now),
            last_run_at: now,
            recovery_point: RecoveryPoint::Started,
            response: None,
        }
    }
}
