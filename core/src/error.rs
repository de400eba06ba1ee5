//! Error types for idempotent request execution.

use crate::key::KeyId;
use crate::key_store::StorageError;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Message returned when a token is reused with different parameters.
pub const MESSAGE_MISMATCH: &str = "There was a mismatch between this request's parameters and the parameters of a previously stored request with the same Idempotency-Key.";

/// Message returned when another request holds the key's lock.
pub const MESSAGE_REQUEST_IN_PROGRESS: &str =
    "An API request with the same Idempotency-Key is already in progress.";

/// Failure reported by a stage or responder.
///
/// Stages wrap whatever went wrong in their side effect (a payment provider
/// error, a timeout) so the orchestrator can surface it without knowing the
/// concrete type.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct StageError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StageError {
    /// Create an error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the source.
    #[must_use]
    pub fn from_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors returned by the orchestrator to its caller.
///
/// The core never retries on its own. [`IdempotencyError::is_retryable`] and
/// [`IdempotencyError::status_code`] give the transport layer what it needs
/// to decide.
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// The request does not fit the key schema (empty or oversized fields).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The token was reused with different parameters.
    #[error("{}", MESSAGE_MISMATCH)]
    FingerprintMismatch {
        /// The existing key
        key_id: KeyId,
    },

    /// Another worker holds a fresh lock on the key.
    #[error("{}", MESSAGE_REQUEST_IN_PROGRESS)]
    RequestInProgress {
        /// The contended key
        key_id: KeyId,
        /// When the current owner took the lock
        locked_at: DateTime<Utc>,
    },

    /// A stage's side effect failed. Progress stays at the last completed stage.
    #[error("Stage '{stage}' failed: {source}")]
    StageExecution {
        /// Name of the failed stage
        stage: String,
        /// What the stage reported
        #[source]
        source: StageError,
    },

    /// All stages completed but the final response could not be computed.
    #[error("Computing the response failed: {0}")]
    ResponseFailed(#[source] StageError),

    /// The stored recovery point names a stage the operation does not declare.
    #[error("Key {key_id} is at unknown recovery point '{recovery_point}'")]
    UnknownRecoveryPoint {
        /// The key
        key_id: KeyId,
        /// The stored recovery point
        recovery_point: String,
    },

    /// The operation definition is invalid (empty, duplicate or reserved stage names).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Another worker stole the lock while this one was executing.
    #[error("Lock on key {key_id} was taken over by another request")]
    LockLost {
        /// The key
        key_id: KeyId,
    },

    /// Transaction or I/O failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl IdempotencyError {
    /// HTTP-equivalent status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::FingerprintMismatch { .. }
            | Self::RequestInProgress { .. }
            | Self::LockLost { .. } => 409,
            Self::Storage(
                StorageError::SerializationFailure(_) | StorageError::DuplicateKey { .. },
            ) => 503,
            Self::StageExecution { .. }
            | Self::ResponseFailed(_)
            | Self::UnknownRecoveryPoint { .. }
            | Self::InvalidOperation(_)
            | Self::Storage(_) => 500,
        }
    }

    /// Whether retrying the same request with the same token can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::RequestInProgress { .. }
            | Self::StageExecution { .. }
            | Self::ResponseFailed(_)
            | Self::LockLost { .. } => true,
            Self::Storage(err) => err.is_transient(),
            Self::InvalidRequest(_)
            | Self::FingerprintMismatch { .. }
            | Self::UnknownRecoveryPoint { .. }
            | Self::InvalidOperation(_) => false,
        }
    }
}
