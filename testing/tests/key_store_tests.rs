//! Tests for the in-memory key store

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use chrono::Duration;
use idempotency_core::key::{NewKey, RecoveryPoint, StoredResponse};
use idempotency_core::key_store::{KeyStore, KeyTransaction, StorageError};
use idempotency_core::request::IdempotentRequest;
use idempotency_testing::{InMemoryKeyStore, TransactionCounts, test_epoch};
use serde_json::json;

fn new_key(token: &str) -> NewKey {
    NewKey::from_request(&IdempotentRequest::new(
        "user-1",
        token,
        "POST",
        "/rides",
        json!({"origin": "A", "target": "B"}),
    ))
}

#[tokio::test]
async fn test_find_or_create_inserts_then_finds() {
    let store = InMemoryKeyStore::new();
    let now = test_epoch();

    let mut tx = store.begin().await.unwrap();
    let (created, was_created) = tx.find_or_create(&new_key("t1"), now).await.unwrap();
    tx.commit().await.unwrap();

    assert!(was_created);
    assert_eq!(created.recovery_point, RecoveryPoint::Started);
    assert_eq!(created.locked_at, Some(now));

    let mut tx = store.begin().await.unwrap();
    let (found, was_created) = tx
        .find_or_create(&new_key("t1"), now + Duration::seconds(5))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(!was_created);
    assert_eq!(found, created);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_tokens_are_scoped_per_caller() {
    let store = InMemoryKeyStore::new();
    let mut other_caller = new_key("t1");
    other_caller.caller_id = "user-2".to_string();

    let mut tx = store.begin().await.unwrap();
    let first = tx.insert_key(&new_key("t1"), test_epoch()).await.unwrap();
    let second = tx.insert_key(&other_caller, test_epoch()).await.unwrap();
    tx.commit().await.unwrap();

    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn test_duplicate_insert_is_rejected() {
    let store = InMemoryKeyStore::new();

    let mut tx = store.begin().await.unwrap();
    tx.insert_key(&new_key("t1"), test_epoch()).await.unwrap();
    let result = tx.insert_key(&new_key("t1"), test_epoch()).await;

    assert!(matches!(result, Err(StorageError::DuplicateKey { .. })));
}

#[tokio::test]
async fn test_dropped_transaction_discards_writes() {
    let store = InMemoryKeyStore::new();

    {
        let mut tx = store.begin().await.unwrap();
        tx.insert_key(&new_key("t1"), test_epoch()).await.unwrap();
    }

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
async fn test_rollback_discards_writes() {
    let store = InMemoryKeyStore::new();

    let mut tx = store.begin().await.unwrap();
    tx.insert_key(&new_key("t1"), test_epoch()).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(store.get("user-1", "t1").await.is_none());
}

#[tokio::test]
async fn test_injected_commit_failure() {
    let store = InMemoryKeyStore::new();
    store.fail_next_commit();

    let mut tx = store.begin().await.unwrap();
    tx.insert_key(&new_key("t1"), test_epoch()).await.unwrap();
    let result = tx.commit().await;

    assert!(matches!(result, Err(StorageError::SerializationFailure(_))));
    assert!(store.is_empty().await);

    // Only the next commit fails
    let mut tx = store.begin().await.unwrap();
    tx.insert_key(&new_key("t1"), test_epoch()).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_lock_progress_and_finalize() {
    let store = InMemoryKeyStore::new();
    let t0 = test_epoch();

    let mut tx = store.begin().await.unwrap();
    let key = tx.insert_key(&new_key("t1"), t0).await.unwrap();
    tx.release_lock(key.id).await.unwrap();
    let relocked = tx.update_lock(key.id, t0 + Duration::seconds(1)).await.unwrap();
    let advanced = tx
        .advance_recovery_point(key.id, "ride_created", t0 + Duration::seconds(2))
        .await
        .unwrap();
    let finished = tx
        .finalize(key.id, &StoredResponse::new(201, json!({"ride": 1})))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(relocked.last_run_at, t0 + Duration::seconds(1));
    assert_eq!(advanced.recovery_point, RecoveryPoint::stage("ride_created"));
    assert_eq!(advanced.locked_at, Some(t0 + Duration::seconds(2)));
    assert_eq!(finished.recovery_point, RecoveryPoint::Finished);
    assert!(finished.locked_at.is_none());
    assert_eq!(finished.finished_response().unwrap().code, 201);

    let stored = store.get("user-1", "t1").await.unwrap();
    assert_eq!(stored, finished);
    assert!(stored.validate().is_ok());
}

#[tokio::test]
async fn test_missing_key_operations_fail() {
    let store = InMemoryKeyStore::new();
    let missing = idempotency_core::KeyId::new(404);

    let mut tx = store.begin().await.unwrap();
    assert!(matches!(
        tx.load_key(missing).await,
        Err(StorageError::KeyNotFound(_))
    ));
    assert!(matches!(
        tx.update_lock(missing, test_epoch()).await,
        Err(StorageError::KeyNotFound(_))
    ));
    assert!(matches!(
        tx.release_lock(missing).await,
        Err(StorageError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn test_transactions_are_serialized() {
    let store = InMemoryKeyStore::new();

    let mut first = store.begin().await.unwrap();
    first.insert_key(&new_key("t1"), test_epoch()).await.unwrap();

    let contender = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut tx = store.begin().await.unwrap();
            let (_, created) = tx.find_or_create(&new_key("t1"), test_epoch()).await.unwrap();
            tx.commit().await.unwrap();
            created
        })
    };

    tokio::task::yield_now().await;
    first.commit().await.unwrap();

    // The contender only began after the first committed, so it saw the key
    assert!(!contender.await.unwrap());
    assert_eq!(store.len().await, 1);
}
