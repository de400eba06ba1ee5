//! `PostgreSQL` implementation of [`KeyStore`].
//!
//! Every transaction is switched to `SERIALIZABLE` right after `BEGIN`.
//! Serialization failures (SQLSTATE `40001`) and unique violations on
//! `(caller_id, idempotency_key)` (SQLSTATE `23505`) surface as the transient
//! [`StorageError`] variants so callers can retry the whole request.

use crate::config::PostgresConfig;
use chrono::{DateTime, Utc};
use idempotency_core::fingerprint::Fingerprint;
use idempotency_core::key::{IdempotencyKey, KeyId, NewKey, RecoveryPoint, StoredResponse};
use idempotency_core::key_store::{KeyStore, KeyTransaction, StorageError};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;

const SERIALIZATION_FAILURE: &str = "40001";
const UNIQUE_VIOLATION: &str = "23505";

fn storage_error(error: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some(SERIALIZATION_FAILURE) {
            metrics::counter!("idempotency_postgres_serialization_failures_total").increment(1);
            tracing::debug!(error = %db, "Serialization failure");
            return StorageError::SerializationFailure(db.message().to_string());
        }
    }
    StorageError::Database(error.to_string())
}

fn corrupt(error: sqlx::Error) -> StorageError {
    StorageError::Corrupt(error.to_string())
}

fn key_from_row(row: &PgRow) -> Result<IdempotencyKey, StorageError> {
    let id = KeyId::new(row.try_get("id").map_err(corrupt)?);

    let code: Option<i32> = row.try_get("response_code").map_err(corrupt)?;
    let body: Option<Json<Value>> = row.try_get("response_body").map_err(corrupt)?;
    let response = match (code, body) {
        (None, None) => None,
        (Some(code), Some(Json(body))) => {
            let response = u16::try_from(code)
                .ok()
                .map(|code| StoredResponse::new(code, body))
                .filter(StoredResponse::has_valid_code)
                .ok_or_else(|| {
                    StorageError::Corrupt(format!("key {id} has invalid response code {code}"))
                })?;
            Some(response)
        }
        _ => {
            return Err(StorageError::Corrupt(format!(
                "key {id} has only one of response code and body"
            )));
        }
    };

    let recovery_point: String = row.try_get("recovery_point").map_err(corrupt)?;

    let key = IdempotencyKey {
        id,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        caller_id: row.try_get("caller_id").map_err(corrupt)?,
        idempotency_token: row.try_get("idempotency_key").map_err(corrupt)?,
        request_method: row.try_get("request_method").map_err(corrupt)?,
        request_path: row.try_get("request_path").map_err(corrupt)?,
        request_fingerprint: Fingerprint::from_canonical(
            row.try_get("request_fingerprint").map_err(corrupt)?,
        ),
        locked_at: row.try_get("locked_at").map_err(corrupt)?,
        last_run_at: row.try_get("last_run_at").map_err(corrupt)?,
        recovery_point: RecoveryPoint::parse(&recovery_point),
        response,
    };
    key.validate()?;
    Ok(key)
}

fn found(row: Option<PgRow>, key_id: KeyId) -> Result<IdempotencyKey, StorageError> {
    row.map_or(Err(StorageError::KeyNotFound(key_id)), |row| key_from_row(&row))
}

/// `PostgreSQL`-backed key store.
///
/// # Example
///
/// ```no_run
/// use idempotency_postgres::{PostgresConfig, PostgresKeyStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresKeyStore::connect(&PostgresConfig::from_env()).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresKeyStore {
    pool: PgPool,
}

impl PostgresKeyStore {
    /// Connect to `database_url` with default pool settings.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        Self::connect(&PostgresConfig::new(database_url)).await
    }

    /// Build a connection pool from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the connection fails.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::Database(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `idempotency_keys` table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl KeyStore for PostgresKeyStore {
    type Transaction = PgKeyTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StorageError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        Ok(PgKeyTransaction { tx })
    }
}

/// A serializable `PostgreSQL` transaction.
///
/// Dropping it without committing rolls back.
#[derive(Debug)]
pub struct PgKeyTransaction {
    tx: Transaction<'static, Postgres>,
}

impl KeyTransaction for PgKeyTransaction {
    async fn find_key(
        &mut self,
        caller_id: &str,
        idempotency_token: &str,
    ) -> Result<Option<IdempotencyKey>, StorageError> {
        let row = sqlx::query(
            "SELECT * FROM idempotency_keys WHERE caller_id = $1 AND idempotency_key = $2",
        )
        .bind(caller_id)
        .bind(idempotency_token)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(key_from_row).transpose()
    }

    async fn load_key(&mut self, key_id: KeyId) -> Result<IdempotencyKey, StorageError> {
        let row = sqlx::query("SELECT * FROM idempotency_keys WHERE id = $1")
            .bind(key_id.value())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        found(row, key_id)
    }

    async fn insert_key(
        &mut self,
        new_key: &NewKey,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyKey, StorageError> {
        let row = sqlx::query(
            r"
            INSERT INTO idempotency_keys (
                created_at, caller_id, idempotency_key, request_method, request_path,
                request_fingerprint, locked_at, last_run_at, recovery_point
            ) VALUES ($1, $2, $3, $4, $5, $6, $1, $1, $7)
            RETURNING *
            ",
        )
        .bind(now)
        .bind(&new_key.caller_id)
        .bind(&new_key.idempotency_token)
        .bind(&new_key.request_method)
        .bind(&new_key.request_path)
        .bind(new_key.request_fingerprint.as_str())
        .bind(RecoveryPoint::STARTED)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            let duplicate = matches!(
                &e,
                sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
            );
            if duplicate {
                StorageError::DuplicateKey {
                    caller_id: new_key.caller_id.clone(),
                    token: new_key.idempotency_token.clone(),
                }
            } else {
                storage_error(e)
            }
        })?;

        key_from_row(&row)
    }

    async fn update_lock(
        &mut self,
        key_id: KeyId,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyKey, StorageError> {
        let row = sqlx::query(
            "UPDATE idempotency_keys SET locked_at = $2, last_run_at = $2 WHERE id = $1 RETURNING *",
        )
        .bind(key_id.value())
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        found(row, key_id)
    }

    async fn release_lock(&mut self, key_id: KeyId) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE idempotency_keys SET locked_at = NULL WHERE id = $1")
            .bind(key_id.value())
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::KeyNotFound(key_id));
        }
        Ok(())
    }

    async fn advance_recovery_point(
        &mut self,
        key_id: KeyId,
        stage: &str,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyKey, StorageError> {
        let row = sqlx::query(
            "UPDATE idempotency_keys SET recovery_point = $2, locked_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(key_id.value())
        .bind(stage)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        found(row, key_id)
    }

    async fn finalize(
        &mut self,
        key_id: KeyId,
        response: &StoredResponse,
    ) -> Result<IdempotencyKey, StorageError> {
        let row = sqlx::query(
            r"
            UPDATE idempotency_keys
            SET recovery_point = $2, response_code = $3, response_body = $4, locked_at = NULL
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(key_id.value())
        .bind(RecoveryPoint::FINISHED)
        .bind(i32::from(response.code))
        .bind(Json(&response.body))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        found(row, key_id)
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(storage_error)
    }
}
