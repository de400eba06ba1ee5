//! Stages: the side effects of a multi-stage operation.
//!
//! External side effects (a payment, a resource created in another system)
//! cannot join the local storage transaction, so they cannot be rolled back.
//! Instead each one is a named [`Stage`]; after it succeeds its name is
//! recorded as the key's recovery point, and a retry resumes after it.
//!
//! A stage should itself be idempotent or happen-at-most-once (for example,
//! by passing the idempotency token on to the payment provider): a worker can
//! crash after the side effect but before its completion is recorded.

use crate::error::StageError;
use crate::key::{IdempotencyKey, KeyId};
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;

/// What a stage sees when it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    /// The key being executed
    pub key_id: KeyId,
    /// Principal that sent the request
    pub caller_id: String,
    /// Client-supplied token
    pub idempotency_token: String,
    /// Request method
    pub request_method: String,
    /// Request path
    pub request_path: String,
    /// Request parameters (identical to the stored fingerprint)
    pub params: Value,
}

impl StageContext {
    /// Bind a key to the parameters of the request executing it.
    #[must_use]
    pub fn new(key: &IdempotencyKey, params: Value) -> Self {
        Self {
            key_id: key.id,
            caller_id: key.caller_id.clone(),
            idempotency_token: key.idempotency_token.clone(),
            request_method: key.request_method.clone(),
            request_path: key.request_path.clone(),
            params,
        }
    }
}

/// One named side effect of an operation.
///
/// # Dyn Compatibility
///
/// `execute` returns an explicit boxed future instead of using `async fn` so
/// that operations can hold heterogeneous stages as `Box<dyn Stage>`.
pub trait Stage: Send + Sync {
    /// Name recorded as the recovery point once the stage completes.
    fn name(&self) -> &str;

    /// Perform the side effect.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] if the side effect failed. The stage will run
    /// again on the next attempt.
    fn execute<'a>(&'a self, ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>>;
}

/// A stage defined by a closure.
///
/// The closure receives an owned copy of the context.
pub struct FnStage<F> {
    name: String,
    run: F,
}

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(&'a self, ctx: &'a StageContext) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin((self.run)(ctx.clone()))
    }
}

/// Build a stage from a name and an async closure.
///
/// # Example
///
/// ```
/// use idempotency_core::stage::{Stage, stage};
///
/// let charge = stage("charge_created", |ctx| async move {
///     let _amount = ctx.params["amount"].as_i64();
///     Ok(())
/// });
/// assert_eq!(charge.name(), "charge_created");
/// ```
pub fn stage<F, Fut>(name: impl Into<String>, run: F) -> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StageError>> + Send + 'static,
{
    FnStage {
        name: name.into(),
        run,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::key::NewKey;
    use crate::request::IdempotentRequest;
    use chrono::Utc;
    use serde_json::json;

    fn context() -> StageContext {
        let request = IdempotentRequest::new("user-1", "t1", "POST", "/rides", json!({"n": 3}));
        let key = NewKey::from_request(&request).into_key(KeyId::new(9), Utc::now());
        StageContext::new(&key, request.params)
    }

    #[tokio::test]
    async fn closure_stage_sees_parameters() {
        let stage = stage("double", |ctx| async move {
            if ctx.params["n"].as_i64() == Some(3) {
                Ok(())
            } else {
                Err(StageError::new("unexpected parameters"))
            }
        });

        assert_eq!(stage.name(), "double");
        stage.execute(&context()).await.unwrap();
    }

    #[tokio::test]
    async fn closure_stage_reports_failure() {
        let stage = stage("fails", |_ctx| async move { Err(StageError::new("boom")) });

        let error = stage.execute(&context()).await.unwrap_err();
        assert_eq!(error.message(), "boom");
    }

    #[test]
    fn context_copies_key_identity() {
        let ctx = context();
        assert_eq!(ctx.key_id, KeyId::new(9));
        assert_eq!(ctx.caller_id, "user-1");
        assert_eq!(ctx.request_path, "/rides");
    }
}
