//! Ride registration: the business side of the demo.
//!
//! Rides and charges live in memory. The payment provider deduplicates
//! charges by idempotency token, the way a real provider accepts an
//! `Idempotency-Key` header.

use idempotency_core::error::{IdempotencyError, StageError};
use idempotency_core::key::{KeyId, StoredResponse};
use idempotency_core::operation::Operation;
use idempotency_core::stage::{StageContext, stage};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Flat fare in cents.
const RIDE_FARE_CENTS: i64 = 2000;

#[derive(Debug, Clone)]
struct Ride {
    id: u64,
    origin: (f64, f64),
    target: (f64, f64),
    charge_id: Option<String>,
}

#[derive(Debug, Default)]
struct Ledger {
    rides: HashMap<KeyId, Ride>,
    charges_by_token: HashMap<String, String>,
}

/// In-memory rides table plus a simulated payment provider.
#[derive(Debug, Clone, Default)]
pub struct RideService {
    ledger: Arc<Mutex<Ledger>>,
}

fn coordinate(ctx: &StageContext, field: &str) -> Result<f64, StageError> {
    ctx.params[field]
        .as_f64()
        .ok_or_else(|| StageError::new(format!("{field} must be a number")))
}

impl RideService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn create_ride(&self, ctx: &StageContext) -> Result<(), StageError> {
        let origin = (coordinate(ctx, "origin_lat")?, coordinate(ctx, "origin_lon")?);
        let target = (coordinate(ctx, "target_lat")?, coordinate(ctx, "target_lon")?);

        let mut ledger = self.ledger.lock().await;
        let id = ledger.rides.len() as u64 + 1;
        let ride = ledger.rides.entry(ctx.key_id).or_insert(Ride {
            id,
            origin,
            target,
            charge_id: None,
        });
        tracing::info!(ride_id = ride.id, key_id = %ctx.key_id, "Ride created");
        Ok(())
    }

    async fn charge(&self, ctx: &StageContext) -> Result<(), StageError> {
        let mut ledger = self.ledger.lock().await;
        let next = ledger.charges_by_token.len() + 1;
        let charge_id = ledger
            .charges_by_token
            .entry(format!("{}:{}", ctx.caller_id, ctx.idempotency_token))
            .or_insert_with(|| format!("ch_{next:06}"))
            .clone();

        let ride = ledger
            .rides
            .get_mut(&ctx.key_id)
            .ok_or_else(|| StageError::new("no ride recorded for this key"))?;
        ride.charge_id = Some(charge_id.clone());

        tracing::info!(%charge_id, amount = RIDE_FARE_CENTS, "Card charged");
        Ok(())
    }

    async fn send_receipt(&self, ctx: &StageContext) -> Result<(), StageError> {
        tracing::info!(caller_id = %ctx.caller_id, "Receipt sent");
        Ok(())
    }

    async fn response(&self, ctx: &StageContext) -> Result<StoredResponse, StageError> {
        let ledger = self.ledger.lock().await;
        let ride = ledger
            .rides
            .get(&ctx.key_id)
            .ok_or_else(|| StageError::new("no ride recorded for this key"))?;

        Ok(StoredResponse::new(
            201,
            json!({
                "ride": {
                    "id": ride.id,
                    "origin": [ride.origin.0, ride.origin.1],
                    "target": [ride.target.0, ride.target.1],
                },
                "charge_id": ride.charge_id,
                "amount": RIDE_FARE_CENTS,
            }),
        ))
    }
}

/// The ride registration operation: create the ride, charge, send a receipt.
///
/// # Errors
///
/// Returns [`IdempotencyError::InvalidOperation`] if the stage list is invalid.
pub fn register_ride(service: &RideService) -> Result<Operation, IdempotencyError> {
    let (create, charge, receipt, respond) =
        (service.clone(), service.clone(), service.clone(), service.clone());

    Operation::builder()
        .stage(stage("ride_created", move |ctx| {
            let service = create.clone();
            async move { service.create_ride(&ctx).await }
        }))
        .stage(stage("charge_created", move |ctx| {
            let service = charge.clone();
            async move { service.charge(&ctx).await }
        }))
        .stage(stage("receipt_sent", move |ctx| {
            let service = receipt.clone();
            async move { service.send_receipt(&ctx).await }
        }))
        .respond(move |ctx| {
            let service = respond.clone();
            async move { service.response(&ctx).await }
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use idempotency_core::request::IdempotentRequest;
    use idempotency_runtime::Orchestrator;
    use idempotency_testing::{InMemoryKeyStore, test_clock};

    fn request(token: &str, params: serde_json::Value) -> IdempotentRequest {
        IdempotentRequest::new("user-1", token, "POST", "/rides", params)
    }

    fn params() -> serde_json::Value {
        json!({"origin_lat": 1.0, "origin_lon": 2.0, "target_lat": 3.0, "target_lon": 4.0})
    }

    #[tokio::test]
    async fn registers_one_ride_per_token() {
        let service = RideService::new();
        let operation = register_ride(&service).unwrap();
        let orchestrator = Orchestrator::new(InMemoryKeyStore::new(), test_clock());

        let first = orchestrator.execute(request("a", params()), &operation).await.unwrap();
        let replay = orchestrator.execute(request("a", params()), &operation).await.unwrap();
        let other = orchestrator.execute(request("b", params()), &operation).await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(first.code, 201);
        assert_eq!(first.body["charge_id"], "ch_000001");
        assert_eq!(other.body["charge_id"], "ch_000002");
        assert_eq!(service.ledger.lock().await.rides.len(), 2);
    }

    #[tokio::test]
    async fn missing_coordinates_fail_the_first_stage() {
        let service = RideService::new();
        let operation = register_ride(&service).unwrap();
        let orchestrator = Orchestrator::new(InMemoryKeyStore::new(), test_clock());

        let error = orchestrator
            .execute(request("a", json!({"origin_lat": 1.0})), &operation)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            IdempotencyError::StageExecution { ref stage, .. } if stage == "ride_created"
        ));
        assert!(service.ledger.lock().await.rides.is_empty());
    }
}
