//! The request orchestrator: the public entry point for idempotent execution.
//!
//! # Flow
//!
//! 1. Validate the request and fingerprint its parameters
//! 2. Admission phase (one transaction): find or create the key, compare the
//!    fingerprint, then replay, acquire, steal or reject per the lock
//! 3. Run the remaining stages, persisting each completion
//! 4. Compute the response and finalize the key (one transaction)
//!
//! A failed stage leaves the key at its last completed stage. By default the
//! lock is kept until it times out; see
//! [`IdempotencyConfig::release_lock_on_stage_failure`].

use crate::atomic_phase::AtomicPhase;
use crate::config::IdempotencyConfig;
use crate::metrics::{IdempotencyMetrics, Outcome};
use crate::recovery::{RecoveryRunner, ensure_lock_held};
use chrono::{DateTime, Utc};
use idempotency_core::environment::Clock;
use idempotency_core::error::{IdempotencyError, StageError};
use idempotency_core::key::{
    IdempotencyKey, KeyId, MAX_RESPONSE_CODE, MIN_RESPONSE_CODE, NewKey, StoredResponse,
};
use idempotency_core::key_store::{KeyStore, KeyTransaction};
use idempotency_core::lock::{LockController, LockDecision};
use idempotency_core::operation::Operation;
use idempotency_core::request::IdempotentRequest;
use idempotency_core::stage::StageContext;
use std::sync::Arc;
use std::time::Instant;

/// Result of the admission phase.
enum Admission {
    /// This caller holds the lock and must run the operation.
    Run(IdempotencyKey),
    /// This caller stole an abandoned lock and must run the operation.
    Stolen {
        key: IdempotencyKey,
        stale_since: DateTime<Utc>,
    },
    /// The operation already finished.
    Replay(StoredResponse),
}

struct Inner<S> {
    store: S,
    clock: Arc<dyn Clock>,
    lock: LockController,
    config: IdempotencyConfig,
}

/// Executes multi-stage operations at most once per idempotency key.
///
/// Cloning is cheap; clones share the store, clock and configuration, so one
/// orchestrator can serve many concurrent tasks.
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(store, SystemClock);
///
/// let operation = Operation::builder()
///     .stage(stage("ride_created", create_ride))
///     .stage(stage("charge_created", charge_card))
///     .respond(|ctx| async move { Ok(StoredResponse::new(201, json!({}))) })?;
///
/// let response = orchestrator.execute(request, &operation).await?;
/// ```
pub struct Orchestrator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KeyStore> Orchestrator<S> {
    /// Create an orchestrator with the default configuration.
    #[must_use]
    pub fn new(store: S, clock: impl Clock + 'static) -> Self {
        Self::with_config(store, clock, IdempotencyConfig::default())
    }

    /// Create an orchestrator with an explicit configuration.
    #[must_use]
    pub fn with_config(store: S, clock: impl Clock + 'static, config: IdempotencyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock: Arc::new(clock),
                lock: LockController::new(config.lock_timeout),
                config,
            }),
        }
    }

    /// The underlying key store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.inner.config
    }

    fn phase(&self) -> AtomicPhase<'_, S> {
        AtomicPhase::new(&self.inner.store)
    }

    /// Execute `operation` for `request`, at most once per `(caller, token)`.
    ///
    /// Returns the computed response, or the stored one if a previous request
    /// with the same token already finished.
    ///
    /// # Errors
    ///
    /// - [`IdempotencyError::InvalidRequest`] if the request does not fit the key schema
    /// - [`IdempotencyError::FingerprintMismatch`] if the token was used with other parameters
    /// - [`IdempotencyError::RequestInProgress`] if another request holds a fresh lock
    /// - [`IdempotencyError::StageExecution`] / [`IdempotencyError::ResponseFailed`]
    ///   if the operation failed; retrying resumes it
    /// - [`IdempotencyError::LockLost`] if another request stole the lock mid-run
    /// - [`IdempotencyError::UnknownRecoveryPoint`] if the key's progress does
    ///   not match the operation's stages
    /// - [`IdempotencyError::Storage`] on transaction failures
    #[tracing::instrument(
        skip(self, request, operation),
        fields(caller_id = %request.caller_id, token = %request.idempotency_token),
        name = "idempotent_execute"
    )]
    pub async fn execute(
        &self,
        request: IdempotentRequest,
        operation: &Operation,
    ) -> Result<StoredResponse, IdempotencyError> {
        let started = Instant::now();
        let result = self.execute_inner(request, operation).await;

        let outcome = match &result {
            Ok((_, outcome)) => *outcome,
            Err(
                IdempotencyError::InvalidRequest(_)
                | IdempotencyError::FingerprintMismatch { .. }
                | IdempotencyError::RequestInProgress { .. },
            ) => Outcome::Rejected,
            Err(_) => Outcome::Failed,
        };
        IdempotencyMetrics::record_request(outcome, started.elapsed());

        result.map(|(response, _)| response)
    }

    async fn execute_inner(
        &self,
        request: IdempotentRequest,
        operation: &Operation,
    ) -> Result<(StoredResponse, Outcome), IdempotencyError> {
        request.validate()?;

        let mut key = match self.admit(NewKey::from_request(&request)).await? {
            Admission::Replay(response) => {
                tracing::info!(code = response.code, "Replaying stored response");
                return Ok((response, Outcome::Replayed));
            }
            Admission::Run(key) => {
                tracing::info!(key_id = %key.id, recovery_point = %key.recovery_point, "Acquired lock");
                key
            }
            Admission::Stolen { key, stale_since } => {
                IdempotencyMetrics::record_steal();
                tracing::warn!(
                    key_id = %key.id,
                    recovery_point = %key.recovery_point,
                    %stale_since,
                    "Took over abandoned lock"
                );
                key
            }
        };

        let ctx = StageContext::new(&key, request.params);

        match self.complete(&mut key, &ctx, operation).await {
            Ok(response) => {
                tracing::info!(key_id = %key.id, code = response.code, "Finalized key");
                Ok((response, Outcome::Completed))
            }
            Err(error) => {
                self.handle_failure(&key, &error).await;
                Err(error)
            }
        }
    }

    /// Find or create the key and decide what this request may do with it.
    async fn admit(&self, new_key: NewKey) -> Result<Admission, IdempotencyError> {
        let now = self.inner.clock.now();
        let lock = self.inner.lock;

        let admission = self
            .phase()
            .run("admission", move |tx| {
                Box::pin(async move {
                    let (key, created) = tx.find_or_create(&new_key, now).await?;
                    if created {
                        return Ok(Admission::Run(key));
                    }

                    if !key.request_fingerprint.matches(&new_key.request_fingerprint) {
                        return Err(IdempotencyError::FingerprintMismatch { key_id: key.id });
                    }

                    match lock.decide(&key, now) {
                        LockDecision::Replay(response) => Ok(Admission::Replay(response)),
                        LockDecision::Acquire => Ok(Admission::Run(tx.update_lock(key.id, now).await?)),
                        LockDecision::Steal { stale_since } => Ok(Admission::Stolen {
                            key: tx.update_lock(key.id, now).await?,
                            stale_since,
                        }),
                        LockDecision::Held { locked_at } => Err(IdempotencyError::RequestInProgress {
                            key_id: key.id,
                            locked_at,
                        }),
                    }
                })
            })
            .await;

        match &admission {
            Err(IdempotencyError::FingerprintMismatch { key_id }) => {
                IdempotencyMetrics::record_conflict("mismatch");
                tracing::warn!(key_id = %key_id, "Idempotency token reused with different parameters");
            }
            Err(IdempotencyError::RequestInProgress { key_id, locked_at }) => {
                IdempotencyMetrics::record_conflict("in_progress");
                tracing::warn!(key_id = %key_id, %locked_at, "Request already in progress");
            }
            _ => {}
        }

        admission
    }

    /// Run the remaining stages, compute the response and finalize.
    ///
    /// `key` tracks the stored record, so after a failure its `locked_at` is
    /// still the lock this request held.
    async fn complete(
        &self,
        key: &mut IdempotencyKey,
        ctx: &StageContext,
        operation: &Operation,
    ) -> Result<StoredResponse, IdempotencyError> {
        let runner = RecoveryRunner::new(&self.inner.store, self.inner.clock.as_ref());
        runner.run(operation.stages(), key, ctx).await?;

        let response = operation.respond(ctx).await.map_err(|source| {
            tracing::warn!(key_id = %key.id, error = %source, "Computing the response failed");
            IdempotencyError::ResponseFailed(source)
        })?;

        if !response.has_valid_code() {
            tracing::warn!(key_id = %key.id, code = response.code, "Response code out of range");
            return Err(IdempotencyError::ResponseFailed(StageError::new(format!(
                "response code {} is outside {MIN_RESPONSE_CODE}..={MAX_RESPONSE_CODE}",
                response.code
            ))));
        }

        let key_id = key.id;
        let held = key.locked_at;
        let stored = response.clone();

        self.phase()
            .run("finalize", move |tx| {
                Box::pin(async move {
                    let current = tx.load_key(key_id).await?;
                    ensure_lock_held(&current, held)?;
                    tx.finalize(key_id, &stored).await?;
                    Ok(())
                })
            })
            .await?;

        Ok(response)
    }

    /// Bookkeeping after a run that acquired the lock but did not finish.
    async fn handle_failure(&self, key: &IdempotencyKey, error: &IdempotencyError) {
        match error {
            IdempotencyError::LockLost { .. } => {
                IdempotencyMetrics::record_conflict("lock_lost");
                tracing::warn!(key_id = %key.id, "Lock taken over by another request, abandoning run");
            }
            IdempotencyError::StageExecution { .. } | IdempotencyError::ResponseFailed(_)
                if self.inner.config.release_lock_on_stage_failure =>
            {
                self.release(key.id, key.locked_at).await;
            }
            _ => {}
        }
    }

    /// Clear the lock, but only if it is still the one this request holds.
    async fn release(&self, key_id: KeyId, held: Option<DateTime<Utc>>) {
        let result = self
            .phase()
            .run("release_lock", move |tx| {
                Box::pin(async move {
                    let current = tx.load_key(key_id).await?;
                    ensure_lock_held(&current, held)?;
                    tx.release_lock(key_id).await?;
                    Ok(())
                })
            })
            .await;

        match result {
            Ok(()) => tracing::debug!(key_id = %key_id, "Released lock after failure"),
            Err(IdempotencyError::LockLost { .. }) => {
                IdempotencyMetrics::record_conflict("lock_lost");
                tracing::warn!(key_id = %key_id, "Lock taken over by another request, leaving it in place");
            }
            Err(error) => tracing::warn!(key_id = %key_id, error = %error, "Failed to release lock"),
        }
    }
}
