//! Stage mocks: count executions, fail on demand, block until released.

use futures::future::BoxFuture;
use idempotency_core::error::StageError;
use idempotency_core::stage::{Stage, StageContext};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// Shared, ordered record of which stages ran.
///
/// Hand the same log to several stages to assert execution order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }

    /// Stage names in the order they ran.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A stage that counts its executions and can be told to fail.
///
/// Clones share the counter and the failure switch, so a test keeps one
/// handle while the operation owns another.
///
/// # Example
///
/// ```
/// use idempotency_testing::RecordingStage;
/// use idempotency_core::stage::Stage;
///
/// let charge = RecordingStage::new("charge_created");
/// charge.set_failing(true);
/// assert_eq!(charge.name(), "charge_created");
/// assert_eq!(charge.calls(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct RecordingStage {
    name: String,
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
    log: Option<CallLog>,
}

impl RecordingStage {
    /// Create a stage that succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
            log: None,
        }
    }

    /// Also record successful runs in `log`.
    #[must_use]
    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// Switch failure on or off for subsequent runs.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// How many times the stage was attempted, failures included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Boxed copy for building an operation.
    #[must_use]
    pub fn boxed(&self) -> Box<dyn Stage> {
        Box::new(self.clone())
    }
}

impl Stage for RecordingStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, _ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StageError::new(format!("{} failed", self.name)));
            }
            if let Some(log) = &self.log {
                log.record(&self.name);
            }
            Ok(())
        })
    }
}

/// Test-side handle of a [`GatedStage`].
#[derive(Debug, Clone, Default)]
pub struct StageGate {
    entered: Arc<Notify>,
    released: Arc<Notify>,
}

impl StageGate {
    /// Wait until the stage has started executing.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the waiting stage finish.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// A stage that parks until its [`StageGate`] releases it.
///
/// Used to hold a key's lock open while a concurrent request arrives.
#[derive(Debug, Clone)]
pub struct GatedStage {
    name: String,
    gate: StageGate,
    calls: Arc<AtomicUsize>,
    fail_on_release: bool,
}

impl GatedStage {
    /// Create a gated stage and the handle that controls it.
    #[must_use]
    pub fn new(name: impl Into<String>) -> (Self, StageGate) {
        let gate = StageGate::default();
        let stage = Self {
            name: name.into(),
            gate: gate.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on_release: false,
        };
        (stage, gate)
    }

    /// Like [`GatedStage::new`], but the stage fails once released.
    ///
    /// Simulates a side effect that hangs past the lock timeout and then errors.
    #[must_use]
    pub fn failing(name: impl Into<String>) -> (Self, StageGate) {
        let (mut stage, gate) = Self::new(name);
        stage.fail_on_release = true;
        (stage, gate)
    }

    /// How many times the stage started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Stage for GatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, _ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.entered.notify_one();
            self.gate.released.notified().await;
            if self.fail_on_release {
                return Err(StageError::new(format!("{} failed", self.name)));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::Utc;
    use idempotency_core::key::{KeyId, NewKey};
    use idempotency_core::request::IdempotentRequest;
    use serde_json::json;

    fn context() -> StageContext {
        let request = IdempotentRequest::new("user-1", "t1", "POST", "/rides", json!({}));
        let key = NewKey::from_request(&request).into_key(KeyId::new(1), Utc::now());
        StageContext::new(&key, json!({}))
    }

    #[tokio::test]
    async fn recording_stage_counts_and_fails() {
        let log = CallLog::new();
        let stage = RecordingStage::new("ride_created").with_log(&log);
        let ctx = context();

        stage.execute(&ctx).await.unwrap();
        stage.set_failing(true);
        assert!(stage.execute(&ctx).await.is_err());

        assert_eq!(stage.calls(), 2);
        assert_eq!(log.entries(), vec!["ride_created".to_string()]);
    }

    #[tokio::test]
    async fn gated_stage_waits_for_release() {
        let (stage, gate) = GatedStage::new("slow");
        let handle = tokio::spawn(async move {
            let ctx = context();
            stage.execute(&ctx).await
        });

        gate.entered().await;
        assert!(!handle.is_finished());
        gate.release();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_gated_stage_errors_after_release() {
        let (stage, gate) = GatedStage::failing("hangs");
        let handle = tokio::spawn(async move {
            let ctx = context();
            stage.execute(&ctx).await
        });

        gate.entered().await;
        gate.release();
        let error = handle.await.unwrap().unwrap_err();
        assert_eq!(error.message(), "hangs failed");
    }
}
