//! In-memory key store for fast, deterministic tests.
//!
//! Transactions hold an exclusive lock on the whole table from `begin` until
//! they finish, so they are trivially serializable. Writes go to a staged
//! copy of the table and only become visible on commit.

use chrono::{DateTime, Utc};
use idempotency_core::key::{IdempotencyKey, KeyId, NewKey, RecoveryPoint, StoredResponse};
use idempotency_core::key_store::{KeyStore, KeyTransaction, StorageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct KeyTable {
    next_id: i64,
    keys: BTreeMap<KeyId, IdempotencyKey>,
}

impl KeyTable {
    fn find(&self, caller_id: &str, token: &str) -> Option<&IdempotencyKey> {
        self.keys
            .values()
            .find(|key| key.caller_id == caller_id && key.idempotency_token == token)
    }

    fn get_mut(&mut self, key_id: KeyId) -> Result<&mut IdempotencyKey, StorageError> {
        self.keys
            .get_mut(&key_id)
            .ok_or(StorageError::KeyNotFound(key_id))
    }
}

#[derive(Debug, Default)]
struct Counters {
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

/// Snapshot of how many transactions a store has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionCounts {
    /// Transactions opened
    pub begun: usize,
    /// Transactions committed
    pub committed: usize,
    /// Transactions rolled back, explicitly or by drop
    pub rolled_back: usize,
}

/// In-memory [`KeyStore`].
///
/// Cloning is cheap and clones share the same table.
///
/// # Example
///
/// ```
/// use idempotency_testing::InMemoryKeyStore;
/// use idempotency_core::key_store::{KeyStore, KeyTransaction};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryKeyStore::new();
/// let mut tx = store.begin().await?;
/// assert!(tx.find_key("user-1", "token-1").await?.is_none());
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryKeyStore {
    table: Arc<Mutex<KeyTable>>,
    counters: Arc<Counters>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryKeyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with a serialization failure.
    ///
    /// The failing transaction's writes are discarded.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Transaction counts so far.
    #[must_use]
    pub fn transaction_counts(&self) -> TransactionCounts {
        TransactionCounts {
            begun: self.counters.begun.load(Ordering::SeqCst),
            committed: self.counters.committed.load(Ordering::SeqCst),
            rolled_back: self.counters.rolled_back.load(Ordering::SeqCst),
        }
    }

    /// Read a key outside any transaction.
    pub async fn get(&self, caller_id: &str, token: &str) -> Option<IdempotencyKey> {
        self.table.lock().await.find(caller_id, token).cloned()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.table.lock().await.keys.len()
    }

    /// Whether no key is stored.
    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.keys.is_empty()
    }

    /// Store a key as-is, replacing any key with the same ID.
    ///
    /// Lets tests set up states a live run would only reach by crashing.
    pub async fn seed(&self, key: IdempotencyKey) {
        let mut table = self.table.lock().await;
        table.next_id = table.next_id.max(key.id.value());
        table.keys.insert(key.id, key);
    }

    /// Overwrite a key's `locked_at`, simulating another worker taking the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key does not exist.
    pub async fn force_lock(
        &self,
        key_id: KeyId,
        locked_at: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError> {
        let mut table = self.table.lock().await;
        table.get_mut(key_id)?.locked_at = locked_at;
        Ok(())
    }
}

impl KeyStore for InMemoryKeyStore {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StorageError> {
        let guard = Arc::clone(&self.table).lock_owned().await;
        let staged = guard.clone();
        self.counters.begun.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryTransaction {
            guard,
            staged,
            counters: Arc::clone(&self.counters),
            fail_next_commit: Arc::clone(&self.fail_next_commit),
            finished: false,
        })
    }
}

/// Transaction over an [`InMemoryKeyStore`].
///
/// Holds the table lock until committed, rolled back or dropped.
#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<KeyTable>,
    staged: KeyTable,
    counters: Arc<Counters>,
    fail_next_commit: Arc<AtomicBool>,
    finished: bool,
}

impl KeyTransaction for InMemoryTransaction {
    async fn find_key(
        &mut self,
        caller_id: &str,
        idempotency_token: &str,
    ) -> Result<Option<IdempotencyKey>, StorageError> {
        Ok(self.staged.find(caller_id, idempotency_token).cloned())
    }

    async fn load_key(&mut self, key_id: KeyId) -> Result<IdempotencyKey, StorageError> {
        self.staged
            .keys
            .get(&key_id)
            .cloned()
            .ok_or(StorageError::KeyNotFound(key_id))
    }

    async fn insert_key(
        &mut self,
        new_key: &NewKey,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyKey, StorageError> {
        if self
            .staged
            .find(&new_key.caller_id, &new_key.idempotency_token)
            .is_some()
        {
            return Err(StorageError::DuplicateKey {
                caller_id: new_key.caller_id.clone(),
                token: new_key.idempotency_token.clone(),
            });
        }

        self.staged.next_id += 1;
        let key = new_key.clone().into_key(KeyId::new(self.staged.next_id), now);
        self.staged.keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn update_lock(
        &mut self,
        key_id: KeyId,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyKey, StorageError> {
        let key = self.staged.get_mut(key_id)?;
        key.locked_at = Some(now);
        key.last_run_at = now;
        Ok(key.clone())
    }

    async fn release_lock(&mut self, key_id: KeyId) -> Result<(), StorageError> {
        self.staged.get_mut(key_id)?.locked_at = None;
        Ok(())
    }

    async fn advance_recovery_point(
        &mut self,
        key_id: KeyId,
        stage: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyKey, StorageError> {
        let key = self.staged.get_mut(key_id)?;
        key.recovery_point = RecoveryPoint::stage(stage);
        key.locked_at = Some(now);
        Ok(key.clone())
    }

    async fn finalize(
        &mut self,
        key_id: KeyId,
        response: &StoredResponse,
    ) -> Result<IdempotencyKey, StorageError> {
        let key = self.staged.get_mut(key_id)?;
        key.recovery_point = RecoveryPoint::Finished;
        key.response = Some(response.clone());
        key.locked_at = None;
        Ok(key.clone())
    }

    async fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::SerializationFailure(
                "injected commit failure".to_string(),
            ));
        }

        *self.guard = std::mem::take(&mut self.staged);
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }
}
