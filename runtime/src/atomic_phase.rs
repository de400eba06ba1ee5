//! Atomic phases: one serializable transaction per unit of key-state work.
//!
//! Every mutation of a key goes through [`AtomicPhase::run`]. The closure
//! receives the open transaction; returning `Ok` commits, returning `Err`
//! rolls back. Business rejections (a mismatch, a held lock) are errors too,
//! so a rejected request leaves no trace in storage.

use futures::future::BoxFuture;
use idempotency_core::error::IdempotencyError;
use idempotency_core::key_store::{KeyStore, KeyTransaction};
use tracing::Instrument;

/// Future returned by the work of an atomic phase.
///
/// It borrows the transaction for `'t` and must own everything else it uses.
pub type PhaseFuture<'t, T> = BoxFuture<'t, Result<T, IdempotencyError>>;

/// Runs closures inside a transaction of a [`KeyStore`].
#[derive(Debug)]
pub struct AtomicPhase<'s, S> {
    store: &'s S,
}

impl<'s, S: KeyStore> AtomicPhase<'s, S> {
    /// Create an executor over `store`.
    #[must_use]
    pub const fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Run `work` in its own transaction.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let key = AtomicPhase::new(&store)
    ///     .run("advance_recovery_point", move |tx| {
    ///         Box::pin(async move {
    ///             Ok(tx.advance_recovery_point(key_id, &stage, now).await?)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns the error of `work` after rolling back, or a
    /// [`StorageError`](idempotency_core::StorageError) if the transaction
    /// cannot begin or commit. A failed rollback is logged; the original
    /// error is still the one returned.
    pub async fn run<T, F>(&self, phase: &'static str, work: F) -> Result<T, IdempotencyError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Transaction) -> PhaseFuture<'t, T> + Send,
    {
        let span = tracing::debug_span!("atomic_phase", phase);

        async move {
            let mut tx = self.store.begin().await?;

            match work(&mut tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    tracing::trace!("Committed");
                    Ok(value)
                }
                Err(error) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        tracing::warn!(
                            error = %rollback_error,
                            cause = %error,
                            "Rollback failed"
                        );
                    }
                    tracing::debug!(error = %error, "Rolled back");
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use idempotency_core::key::{KeyId, NewKey};
    use idempotency_core::request::IdempotentRequest;
    use idempotency_core::StorageError;
    use idempotency_testing::{InMemoryKeyStore, TransactionCounts, test_epoch};
    use serde_json::json;

    fn new_key() -> NewKey {
        NewKey::from_request(&IdempotentRequest::new(
            "user-1",
            "t1",
            "POST",
            "/rides",
            json!({}),
        ))
    }

    #[tokio::test]
    async fn ok_commits() {
        let store = InMemoryKeyStore::new();
        let new_key = new_key();

        let id = AtomicPhase::new(&store)
            .run("insert", move |tx| {
                Box::pin(async move { Ok(tx.insert_key(&new_key, test_epoch()).await?.id) })
            })
            .await
            .unwrap();

        assert_eq!(id, KeyId::new(1));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.transaction_counts().committed, 1);
    }

    #[tokio::test]
    async fn err_rolls_back() {
        let store = InMemoryKeyStore::new();
        let new_key = new_key();

        let result: Result<(), _> = AtomicPhase::new(&store)
            .run("insert_then_reject", move |tx| {
                Box::pin(async move {
                    let key = tx.insert_key(&new_key, test_epoch()).await?;
                    Err(IdempotencyError::FingerprintMismatch { key_id: key.id })
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(IdempotencyError::FingerprintMismatch { .. })
        ));
        assert!(store.is_empty().await);
        assert_eq!(
            store.transaction_counts(),
            TransactionCounts {
                begun: 1,
                committed: 0,
                rolled_back: 1
            }
        );
    }

    #[tokio::test]
    async fn commit_failure_is_reported() {
        let store = InMemoryKeyStore::new();
        store.fail_next_commit();
        let new_key = new_key();

        let result = AtomicPhase::new(&store)
            .run("insert", move |tx| {
                Box::pin(async move { Ok(tx.insert_key(&new_key, test_epoch()).await?.id) })
            })
            .await;

        assert!(matches!(
            result,
            Err(IdempotencyError::Storage(StorageError::SerializationFailure(_)))
        ));
        assert!(store.is_empty().await);
    }
}
