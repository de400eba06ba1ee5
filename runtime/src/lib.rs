//! # Idempotency Runtime
//!
//! Drives the idempotency-key protocol on top of any
//! [`KeyStore`](idempotency_core::KeyStore).
//!
//! ## Core Components
//!
//! - **Orchestrator**: Public entry point; admits, runs and finalizes requests
//! - **Atomic phase**: One serializable transaction per unit of key-state work
//! - **Recovery runner**: Executes the stages a key has not completed, persisting each
//! - **Metrics**: Prometheus counters for outcomes, stages, steals and conflicts
//!
//! ## Example
//!
//! ```ignore
//! use idempotency_runtime::{IdempotencyConfig, Orchestrator};
//! use idempotency_core::{IdempotentRequest, Operation, StoredResponse, environment::SystemClock, stage};
//!
//! let orchestrator = Orchestrator::with_config(store, SystemClock, IdempotencyConfig::from_env());
//!
//! let operation = Operation::builder()
//!     .stage(stage("charge_created", |ctx| async move { charge(&ctx).await }))
//!     .respond(|_ctx| async { Ok(StoredResponse::ok(json!({"charged": true}))) })?;
//!
//! let request = IdempotentRequest::new(user_id, token, "POST", "/charges", params);
//! let response = orchestrator.execute(request, &operation).await?;
//! ```

/// Transactional execution of key-state work
pub mod atomic_phase;

/// Orchestrator configuration
pub mod config;

/// Prometheus metrics for observability
pub mod metrics;

/// The request orchestrator
pub mod orchestrator;

/// Stage execution with persisted progress
pub mod recovery;

pub use atomic_phase::{AtomicPhase, PhaseFuture};
pub use config::IdempotencyConfig;
pub use orchestrator::Orchestrator;
pub use recovery::RecoveryRunner;
