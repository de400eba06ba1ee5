//! Prometheus metrics for idempotent request execution.
//!
//! # Example
//!
//! ```rust,no_run
//! use idempotency_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Exposition text for a /metrics handler
//! let _body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and renders the exposition text for
/// whatever HTTP endpoint the application serves it on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the exposition endpoint is announced on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., by another test), this logs
    /// a warning and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "idempotency_requests_total",
        "Requests handled by the orchestrator, by outcome"
    );
    describe_counter!(
        "idempotency_stages_executed_total",
        "Stages that completed and had their recovery point persisted"
    );
    describe_counter!(
        "idempotency_stage_failures_total",
        "Stages whose side effect failed"
    );
    describe_counter!(
        "idempotency_lock_steals_total",
        "Abandoned locks taken over after the lock timeout"
    );
    describe_counter!(
        "idempotency_conflicts_total",
        "Requests rejected because of a mismatch, a held lock or a lost lock"
    );
    describe_histogram!(
        "idempotency_execute_duration_seconds",
        "Time taken by Orchestrator::execute"
    );
}

/// How an `execute` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stages ran and the key was finalized
    Completed,
    /// A stored response was returned
    Replayed,
    /// Rejected without running anything
    Rejected,
    /// A stage, the responder or storage failed
    Failed,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Replayed => "replayed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

/// Idempotency metrics recorder.
pub struct IdempotencyMetrics;

impl IdempotencyMetrics {
    /// Record a finished `execute` call.
    pub fn record_request(outcome: Outcome, duration: Duration) {
        counter!("idempotency_requests_total", "outcome" => outcome.as_str()).increment(1);
        histogram!("idempotency_execute_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a completed stage.
    pub fn record_stage(stage: &str) {
        counter!("idempotency_stages_executed_total", "stage" => stage.to_string()).increment(1);
    }

    /// Record a failed stage.
    pub fn record_stage_failure(stage: &str) {
        counter!("idempotency_stage_failures_total", "stage" => stage.to_string()).increment(1);
    }

    /// Record a stolen lock.
    pub fn record_steal() {
        counter!("idempotency_lock_steals_total").increment(1);
    }

    /// Record a rejection (`mismatch`, `in_progress`, `lock_lost`).
    pub fn record_conflict(kind: &'static str) {
        counter!("idempotency_conflicts_total", "kind" => kind).increment(1);
    }
}
