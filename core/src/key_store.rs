//! Key store traits: the only seam through which the core touches storage.
//!
//! # Design
//!
//! A [`KeyStore`] opens transactions; a [`KeyTransaction`] carries out the
//! handful of key operations the protocol needs and is finished with
//! [`commit`](KeyTransaction::commit) or [`rollback`](KeyTransaction::rollback).
//! Dropping a transaction without committing must discard its writes.
//!
//! Transactions must run at **serializable** isolation. The find-or-create
//! and lock decision has to be linearizable across concurrent callers racing
//! on the same `(caller, token)`: under weaker isolation two transactions can
//! both see "no row" or both see "lock free" and both execute.
//!
//! No method performs business validation. Fingerprint comparison and lock
//! decisions belong to the caller, inside the same transaction.
//!
//! # Implementations
//!
//! - `PostgresKeyStore` (in `idempotency-postgres` crate): Production implementation
//! - `InMemoryKeyStore` (in `idempotency-testing` crate): Fast, deterministic testing

use crate::key::{IdempotencyKey, KeyId, NewKey, StoredResponse};
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

/// Errors that can occur during key store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Connection, query or commit failure.
    #[error("Database error: {0}")]
    Database(String),

    /// The transaction lost a serialization race against a concurrent one.
    ///
    /// Nothing was written; retrying the whole request is safe.
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// A concurrent transaction inserted the same `(caller, token)` first.
    #[error("Duplicate idempotency key for caller {caller_id}: {token}")]
    DuplicateKey {
        /// Caller of the conflicting insert
        caller_id: String,
        /// Token of the conflicting insert
        token: String,
    },

    /// No key with this ID exists.
    #[error("Idempotency key not found: {0}")]
    KeyNotFound(KeyId),

    /// A stored record violates the key invariants or cannot be decoded.
    #[error("Corrupt idempotency key record: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether the failure came from racing a concurrent transaction.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SerializationFailure(_) | Self::DuplicateKey { .. }
        )
    }
}

/// Transactional storage for idempotency keys.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` so one store can be shared by many
/// concurrent requests.
pub trait KeyStore: Send + Sync {
    /// Transaction type produced by [`begin`](KeyStore::begin).
    type Transaction: KeyTransaction;

    /// Open a serializable transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if no transaction can be started.
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, StorageError>> + Send;
}

/// One serializable unit of key-state work.
///
/// Mutating methods return the record as stored, so callers hold the exact
/// persisted timestamps (backends may truncate precision).
pub trait KeyTransaction: Send {
    /// Find the key for a `(caller, token)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on I/O failure or a corrupt record.
    fn find_key(
        &mut self,
        caller_id: &str,
        idempotency_token: &str,
    ) -> impl Future<Output = Result<Option<IdempotencyKey>, StorageError>> + Send;

    /// Load a key by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key does not exist.
    fn load_key(
        &mut self,
        key_id: KeyId,
    ) -> impl Future<Output = Result<IdempotencyKey, StorageError>> + Send;

    /// Insert a new key: recovery point `started`, locked and run at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateKey`] if the pair already exists.
    fn insert_key(
        &mut self,
        new_key: &NewKey,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<IdempotencyKey, StorageError>> + Send;

    /// Take the lock: set `locked_at` and `last_run_at` to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key does not exist.
    fn update_lock(
        &mut self,
        key_id: KeyId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<IdempotencyKey, StorageError>> + Send;

    /// Clear `locked_at` without touching progress.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key does not exist.
    fn release_lock(
        &mut self,
        key_id: KeyId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Record that `stage` completed; refreshes `locked_at` to `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key does not exist.
    fn advance_recovery_point(
        &mut self,
        key_id: KeyId,
        stage: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<IdempotencyKey, StorageError>> + Send;

    /// Store the final response, set the recovery point to `finished` and
    /// clear the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key does not exist.
    fn finalize(
        &mut self,
        key_id: KeyId,
        response: &StoredResponse,
    ) -> impl Future<Output = Result<IdempotencyKey, StorageError>> + Send;

    /// Commit all writes made in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::SerializationFailure`] if the commit lost a
    /// race, or [`StorageError::Database`] on other failures.
    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Discard all writes made in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the rollback itself fails.
    fn rollback(self) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Return the existing key for the pair, or insert a new locked one.
    ///
    /// The flag is `true` when the key was created by this call. An existing
    /// key is returned unmodified.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`find_key`](KeyTransaction::find_key) and
    /// [`insert_key`](KeyTransaction::insert_key).
    fn find_or_create(
        &mut self,
        new_key: &NewKey,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(IdempotencyKey, bool), StorageError>> + Send
    where
        Self: Sized,
    {
        async move {
            if let Some(existing) = self
                .find_key(&new_key.caller_id, &new_key.idempotency_token)
                .await?
            {
                return Ok((existing, false));
            }

            let created = self.insert_key(new_key, now).await?;
            Ok((created, true))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_error_display() {
        let error = StorageError::DuplicateKey {
            caller_id: "user-1".to_string(),
            token: "abc".to_string(),
        };

        let display = format!("{error}");
        assert!(display.contains("user-1"));
        assert!(display.contains("abc"));
        assert!(error.is_transient());
    }

    #[test]
    fn key_not_found_error_display() {
        let error = StorageError::KeyNotFound(KeyId::new(42));
        assert!(format!("{error}").contains("42"));
        assert!(!error.is_transient());
    }
}
