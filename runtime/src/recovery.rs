//! Recovery runner: executes the stages a key has not completed yet.
//!
//! Each completed stage is persisted in its own atomic phase before the next
//! one starts, so a crash loses at most the stage that was running. Before
//! persisting, the runner reloads the key and checks that the lock it holds
//! is still the one stored (lock fencing): if another worker stole the lock
//! after a timeout, this worker stops without recording anything.

use crate::atomic_phase::AtomicPhase;
use crate::metrics::IdempotencyMetrics;
use chrono::{DateTime, Utc};
use idempotency_core::environment::Clock;
use idempotency_core::error::IdempotencyError;
use idempotency_core::key::IdempotencyKey;
use idempotency_core::key_store::{KeyStore, KeyTransaction};
use idempotency_core::operation::StageSequence;
use idempotency_core::stage::StageContext;

/// Fail with [`IdempotencyError::LockLost`] unless `current` is still locked at `held`.
pub(crate) fn ensure_lock_held(
    current: &IdempotencyKey,
    held: Option<DateTime<Utc>>,
) -> Result<(), IdempotencyError> {
    if held.is_some() && current.locked_at == held {
        Ok(())
    } else {
        Err(IdempotencyError::LockLost { key_id: current.id })
    }
}

/// Drives a key through the remaining stages of a [`StageSequence`].
pub struct RecoveryRunner<'a, S> {
    phase: AtomicPhase<'a, S>,
    clock: &'a dyn Clock,
}

impl<'a, S: KeyStore> RecoveryRunner<'a, S> {
    /// Create a runner persisting progress to `store`.
    #[must_use]
    pub const fn new(store: &'a S, clock: &'a dyn Clock) -> Self {
        Self {
            phase: AtomicPhase::new(store),
            clock,
        }
    }

    /// Execute every stage after `key`'s recovery point, in order.
    ///
    /// `key` must be locked by the caller. It is replaced by the stored record
    /// after each persisted stage, so on success and on failure alike its
    /// `locked_at` is the lock the caller last held.
    ///
    /// # Errors
    ///
    /// - [`IdempotencyError::UnknownRecoveryPoint`] if the key's recovery point
    ///   is not in `sequence` (nothing runs)
    /// - [`IdempotencyError::StageExecution`] if a stage fails; the recovery
    ///   point stays at the last completed stage
    /// - [`IdempotencyError::LockLost`] if another worker took the lock
    /// - [`IdempotencyError::Storage`] if persisting progress failed
    #[tracing::instrument(skip(self, sequence, key, ctx), fields(key_id = %key.id), name = "recovery_runner")]
    pub async fn run(
        &self,
        sequence: &StageSequence,
        key: &mut IdempotencyKey,
        ctx: &StageContext,
    ) -> Result<(), IdempotencyError> {
        let remaining = sequence.remaining(key)?;
        tracing::debug!(
            recovery_point = %key.recovery_point,
            remaining = remaining.len(),
            "Resuming operation"
        );

        for stage in remaining {
            let name = stage.name().to_string();

            if let Err(source) = stage.execute(ctx).await {
                IdempotencyMetrics::record_stage_failure(&name);
                tracing::warn!(stage = %name, error = %source, "Stage failed");
                return Err(IdempotencyError::StageExecution {
                    stage: name,
                    source,
                });
            }

            let key_id = key.id;
            let held = key.locked_at;
            let now = self.clock.now();
            let completed = name.clone();

            *key = self
                .phase
                .run("advance_recovery_point", move |tx| {
                    Box::pin(async move {
                        let current = tx.load_key(key_id).await?;
                        ensure_lock_held(&current, held)?;
                        Ok(tx.advance_recovery_point(key_id, &completed, now).await?)
                    })
                })
                .await?;

            IdempotencyMetrics::record_stage(&name);
            tracing::debug!(stage = %name, "Stage completed");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::Duration;
    use idempotency_core::key::{NewKey, RecoveryPoint};
    use idempotency_core::request::IdempotentRequest;
    use idempotency_testing::{CallLog, InMemoryKeyStore, MockClock, RecordingStage};
    use serde_json::json;

    struct Fixture {
        store: InMemoryKeyStore,
        clock: MockClock,
        log: CallLog,
        stages: Vec<RecordingStage>,
    }

    impl Fixture {
        fn new() -> Self {
            let log = CallLog::new();
            let stages = ["create", "charge", "notify"]
                .into_iter()
                .map(|name| RecordingStage::new(name).with_log(&log))
                .collect();
            Self {
                store: InMemoryKeyStore::new(),
                clock: MockClock::default(),
                log,
                stages,
            }
        }

        fn sequence(&self) -> StageSequence {
            StageSequence::new(self.stages.iter().map(RecordingStage::boxed).collect()).unwrap()
        }

        async fn seed(&self, point: RecoveryPoint) -> (IdempotencyKey, StageContext) {
            let request = IdempotentRequest::new("user-1", "t1", "POST", "/rides", json!({}));
            let mut key = NewKey::from_request(&request).into_key(
                idempotency_core::KeyId::new(1),
                self.clock.now(),
            );
            key.recovery_point = point;
            self.store.seed(key.clone()).await;
            let ctx = StageContext::new(&key, request.params);
            (key, ctx)
        }
    }

    #[tokio::test]
    async fn runs_all_stages_from_started() {
        let fixture = Fixture::new();
        let (mut key, ctx) = fixture.seed(RecoveryPoint::Started).await;

        let runner = RecoveryRunner::new(&fixture.store, &fixture.clock);
        runner.run(&fixture.sequence(), &mut key, &ctx).await.unwrap();

        assert_eq!(key.recovery_point, RecoveryPoint::stage("notify"));
        assert_eq!(fixture.log.entries(), vec!["create", "charge", "notify"]);
    }

    #[tokio::test]
    async fn resumes_after_recovery_point() {
        let fixture = Fixture::new();
        let (mut key, ctx) = fixture.seed(RecoveryPoint::stage("create")).await;

        let runner = RecoveryRunner::new(&fixture.store, &fixture.clock);
        runner.run(&fixture.sequence(), &mut key, &ctx).await.unwrap();

        assert_eq!(fixture.log.entries(), vec!["charge", "notify"]);
        assert_eq!(fixture.stages[0].calls(), 0);
    }

    #[tokio::test]
    async fn failure_keeps_last_completed_stage() {
        let fixture = Fixture::new();
        fixture.stages[1].set_failing(true);
        let (mut key, ctx) = fixture.seed(RecoveryPoint::Started).await;
        fixture.clock.advance(Duration::seconds(5));

        let runner = RecoveryRunner::new(&fixture.store, &fixture.clock);
        let error = runner.run(&fixture.sequence(), &mut key, &ctx).await.unwrap_err();

        assert!(matches!(
            error,
            IdempotencyError::StageExecution { ref stage, .. } if stage == "charge"
        ));
        assert_eq!(fixture.stages[2].calls(), 0);
        let stored = fixture.store.get("user-1", "t1").await.unwrap();
        assert_eq!(stored.recovery_point, RecoveryPoint::stage("create"));
        // The caller still knows which lock it holds after the failure
        assert_eq!(key.locked_at, Some(fixture.clock.now()));
        assert_eq!(key.locked_at, stored.locked_at);
    }

    #[tokio::test]
    async fn progress_refreshes_lock() {
        let fixture = Fixture::new();
        let (mut key, ctx) = fixture.seed(RecoveryPoint::Started).await;
        fixture.clock.advance(Duration::seconds(30));

        let runner = RecoveryRunner::new(&fixture.store, &fixture.clock);
        runner.run(&fixture.sequence(), &mut key, &ctx).await.unwrap();

        assert_eq!(key.locked_at, Some(fixture.clock.now()));
    }

    #[tokio::test]
    async fn stolen_lock_stops_the_runner() {
        let fixture = Fixture::new();
        let (mut key, ctx) = fixture.seed(RecoveryPoint::Started).await;
        fixture
            .store
            .force_lock(key.id, Some(fixture.clock.now() + Duration::seconds(91)))
            .await
            .unwrap();

        let runner = RecoveryRunner::new(&fixture.store, &fixture.clock);
        let error = runner.run(&fixture.sequence(), &mut key, &ctx).await.unwrap_err();

        assert!(matches!(error, IdempotencyError::LockLost { .. }));
        // The first stage ran but its completion was not recorded
        assert_eq!(fixture.stages[0].calls(), 1);
        assert_eq!(fixture.stages[1].calls(), 0);
        let stored = fixture.store.get("user-1", "t1").await.unwrap();
        assert_eq!(stored.recovery_point, RecoveryPoint::Started);
    }

    #[tokio::test]
    async fn unknown_recovery_point_runs_nothing() {
        let fixture = Fixture::new();
        let (mut key, ctx) = fixture.seed(RecoveryPoint::stage("refund")).await;

        let runner = RecoveryRunner::new(&fixture.store, &fixture.clock);
        let error = runner.run(&fixture.sequence(), &mut key, &ctx).await.unwrap_err();

        assert!(matches!(error, IdempotencyError::UnknownRecoveryPoint { .. }));
        assert!(fixture.log.entries().is_empty());
        assert!(fixture.stages.iter().all(|stage| stage.calls() == 0));
    }
}
