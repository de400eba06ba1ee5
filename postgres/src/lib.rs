//! `PostgreSQL` key store for idempotency keys.
//!
//! This crate provides a production key store that implements the
//! `KeyStore` trait from `idempotency-core`. It uses sqlx and supports:
//!
//! - Serializable transactions with typed conflict errors
//! - Connection pooling configured from the environment
//! - Embedded migrations for the `idempotency_keys` table
//!
//! # Example
//!
//! ```ignore
//! use idempotency_postgres::PostgresKeyStore;
//! use idempotency_runtime::Orchestrator;
//! use idempotency_core::environment::SystemClock;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresKeyStore::new("postgres://localhost/mydb").await?;
//!     store.migrate().await?;
//!     let orchestrator = Orchestrator::new(store, SystemClock);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Connection configuration
pub mod config;

/// The key store and its transaction type
pub mod key_store;

pub use config::PostgresConfig;
pub use key_store::{PgKeyTransaction, PostgresKeyStore};
