//! Operations: an ordered stage sequence plus a responder.
//!
//! [`StageSequence`] is the data half of the recovery-point state machine: it
//! maps a key's stored recovery point to the first stage that has not run
//! yet. The runtime walks the remaining stages and persists each completion.

use crate::error::{IdempotencyError, StageError};
use crate::key::{IdempotencyKey, MAX_RECOVERY_POINT_LEN, RecoveryPoint, StoredResponse};
use crate::stage::{Stage, StageContext};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;

/// Computes the final response once every stage has completed.
pub type Responder =
    Box<dyn Fn(StageContext) -> BoxFuture<'static, Result<StoredResponse, StageError>> + Send + Sync>;

/// A validated, ordered list of uniquely named stages.
pub struct StageSequence {
    stages: Vec<Box<dyn Stage>>,
}

impl StageSequence {
    /// Validate and wrap a list of stages.
    ///
    /// An empty list is allowed: the operation then consists of its responder only.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidOperation`] if a name is empty, too
    /// long for the recovery point column, equal to a sentinel
    /// (`started`/`finished`), or used twice.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self, IdempotencyError> {
        let mut seen = HashSet::with_capacity(stages.len());
        for stage in &stages {
            let name = stage.name();
            if name.is_empty() {
                return Err(IdempotencyError::InvalidOperation(
                    "stage names must not be empty".to_string(),
                ));
            }
            if name.chars().count() > MAX_RECOVERY_POINT_LEN {
                return Err(IdempotencyError::InvalidOperation(format!(
                    "stage name '{name}' exceeds {MAX_RECOVERY_POINT_LEN} characters"
                )));
            }
            if RecoveryPoint::is_sentinel(name) {
                return Err(IdempotencyError::InvalidOperation(format!(
                    "stage name '{name}' is reserved"
                )));
            }
            if !seen.insert(name.to_string()) {
                return Err(IdempotencyError::InvalidOperation(format!(
                    "stage name '{name}' is declared twice"
                )));
            }
        }
        Ok(Self { stages })
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the sequence has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Index of the first stage that has not completed for `key`.
    ///
    /// `started` resumes at 0, a stage name resumes right after that stage,
    /// `finished` resumes past the end.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::UnknownRecoveryPoint`] if the key's
    /// recovery point names a stage this sequence does not declare.
    pub fn resume_index(&self, key: &IdempotencyKey) -> Result<usize, IdempotencyError> {
        match &key.recovery_point {
            RecoveryPoint::Started => Ok(0),
            RecoveryPoint::Finished => Ok(self.stages.len()),
            RecoveryPoint::Stage(name) => self
                .stages
                .iter()
                .position(|stage| stage.name() == name)
                .map(|index| index + 1)
                .ok_or_else(|| IdempotencyError::UnknownRecoveryPoint {
                    key_id: key.id,
                    recovery_point: name.clone(),
                }),
        }
    }

    /// Stages still to run for `key`, in order.
    ///
    /// # Errors
    ///
    /// See [`resume_index`](StageSequence::resume_index).
    pub fn remaining(&self, key: &IdempotencyKey) -> Result<&[Box<dyn Stage>], IdempotencyError> {
        let start = self.resume_index(key)?;
        Ok(&self.stages[start..])
    }
}

impl fmt::Debug for StageSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A multi-stage operation guarded by an idempotency key.
pub struct Operation {
    stages: StageSequence,
    responder: Responder,
}

impl Operation {
    /// Create an operation from its stages and responder.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidOperation`] if the stage names are
    /// invalid (see [`StageSequence::new`]).
    pub fn new<R, Fut>(stages: Vec<Box<dyn Stage>>, respond: R) -> Result<Self, IdempotencyError>
    where
        R: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StoredResponse, StageError>> + Send + 'static,
    {
        Ok(Self {
            stages: StageSequence::new(stages)?,
            responder: Box::new(move |ctx| Box::pin(respond(ctx))),
        })
    }

    /// Start building an operation stage by stage.
    #[must_use]
    pub fn builder() -> OperationBuilder {
        OperationBuilder { stages: Vec::new() }
    }

    /// The stage sequence.
    #[must_use]
    pub const fn stages(&self) -> &StageSequence {
        &self.stages
    }

    /// Compute the final response.
    pub fn respond(&self, ctx: &StageContext) -> BoxFuture<'static, Result<StoredResponse, StageError>> {
        (self.responder)(ctx.clone())
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Operation`].
#[derive(Default)]
pub struct OperationBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl OperationBuilder {
    /// Append a stage.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Finish with the responder.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidOperation`] if the stage names are invalid.
    pub fn respond<R, Fut>(self, respond: R) -> Result<Operation, IdempotencyError>
    where
        R: Fn(StageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StoredResponse, StageError>> + Send + 'static,
    {
        Operation::new(self.stages, respond)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::key::{KeyId, NewKey};
    use crate::request::IdempotentRequest;
    use crate::stage::stage;
    use chrono::Utc;
    use serde_json::json;

    fn noop(name: &str) -> Box<dyn Stage> {
        Box::new(stage(name, |_ctx| async { Ok(()) }))
    }

    fn key_at(point: RecoveryPoint) -> IdempotencyKey {
        let request = IdempotentRequest::new("user-1", "t1", "POST", "/rides", json!({}));
        let mut key = NewKey::from_request(&request).into_key(KeyId::new(3), Utc::now());
        key.recovery_point = point;
        key
    }

    fn sequence() -> StageSequence {
        StageSequence::new(vec![noop("create"), noop("charge"), noop("notify")]).unwrap()
    }

    #[test]
    fn started_resumes_at_first_stage() {
        assert_eq!(sequence().resume_index(&key_at(RecoveryPoint::Started)).unwrap(), 0);
    }

    #[test]
    fn completed_stage_resumes_after_it() {
        let seq = sequence();
        let key = key_at(RecoveryPoint::stage("create"));
        let names: Vec<&str> = seq.remaining(&key).unwrap().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["charge", "notify"]);
    }

    #[test]
    fn last_stage_leaves_nothing_to_run() {
        let key = key_at(RecoveryPoint::stage("notify"));
        assert!(sequence().remaining(&key).unwrap().is_empty());
    }

    #[test]
    fn finished_leaves_nothing_to_run() {
        assert_eq!(sequence().resume_index(&key_at(RecoveryPoint::Finished)).unwrap(), 3);
    }

    #[test]
    fn unknown_recovery_point_is_rejected() {
        let result = sequence().resume_index(&key_at(RecoveryPoint::stage("refund")));
        assert!(matches!(
            result,
            Err(IdempotencyError::UnknownRecoveryPoint { recovery_point, .. }) if recovery_point == "refund"
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = StageSequence::new(vec![noop("create"), noop("create")]);
        assert!(matches!(result, Err(IdempotencyError::InvalidOperation(_))));
    }

    #[test]
    fn sentinel_names_are_rejected() {
        assert!(StageSequence::new(vec![noop("started")]).is_err());
        assert!(StageSequence::new(vec![noop("finished")]).is_err());
        assert!(StageSequence::new(vec![noop("")]).is_err());
        assert!(StageSequence::new(vec![noop(&"s".repeat(51))]).is_err());
    }

    #[tokio::test]
    async fn builder_wires_responder() {
        let operation = Operation::builder()
            .stage(stage("create", |_ctx| async { Ok(()) }))
            .respond(|ctx| async move { Ok(StoredResponse::new(201, json!({"key": ctx.key_id}))) })
            .unwrap();

        assert_eq!(operation.stages().names(), vec!["create"]);

        let key = key_at(RecoveryPoint::stage("create"));
        let response = operation
            .respond(&StageContext::new(&key, json!({})))
            .await
            .unwrap();
        assert_eq!(response.code, 201);
        assert_eq!(response.body, json!({"key": 3}));
    }
}
