//! Observability hooks emitted by the execution driver.
//!
//! The driver reports counters and timings through the [`MetricsSink`]
//! trait; sinks are pluggable and default to no-ops. With the `metrics`
//! feature enabled, [`MetricsEmitter`] forwards everything to the
//! [`metrics`] facade so any installed recorder (Prometheus, statsd, ...)
//! picks it up. Structured logging is separate and always on via
//! `tracing`.

use std::time::Duration;

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global tracing subscriber suited to executor processes:
/// env-filtered fmt output plus span-trace capture for error reports.
///
/// Respects `RUST_LOG`; defaults to `info` for this crate. Call once at
/// process start; later calls return `false` when a subscriber is already
/// installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stepledger=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_span_events(FmtSpan::CLOSE))
        .with(ErrorLayer::default())
        .try_init()
        .is_ok()
}

/// Outcome label for a finished step execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed,
}

impl StepOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Completed => "completed",
            StepOutcome::Failed => "failed",
        }
    }
}

/// Sink for driver-emitted execution metrics.
///
/// All methods default to no-ops so sinks implement only what they care
/// about. Implementations must be cheap and non-blocking; the driver calls
/// them on the workflow task.
pub trait MetricsSink: Send + Sync {
    fn workflow_started(&self, workflow_name: &str) {
        let _ = workflow_name;
    }

    fn workflow_finished(&self, workflow_name: &str, outcome: &str, duration: Duration) {
        let _ = (workflow_name, outcome, duration);
    }

    fn lease_acquisition(&self, workflow_name: &str, acquired: bool, duration: Duration) {
        let _ = (workflow_name, acquired, duration);
    }

    fn restore_completed(
        &self,
        workflow_name: &str,
        events_replayed: u64,
        had_snapshot: bool,
        duration: Duration,
    ) {
        let _ = (workflow_name, events_replayed, had_snapshot, duration);
    }

    fn step_executed(
        &self,
        workflow_name: &str,
        step_name: &str,
        outcome: StepOutcome,
        duration_ms: u64,
        cached: bool,
    ) {
        let _ = (workflow_name, step_name, outcome, duration_ms, cached);
    }

    fn step_retried(&self, workflow_name: &str, step_name: &str, attempt: i64) {
        let _ = (workflow_name, step_name, attempt);
    }

    fn snapshot_written(&self, workflow_name: &str, inline: bool) {
        let _ = (workflow_name, inline);
    }

    fn distill_executed(&self, workflow_name: &str, chunks: u64, failed: bool) {
        let _ = (workflow_name, chunks, failed);
    }

    fn heartbeat_failed(&self, workflow_name: &str) {
        let _ = workflow_name;
    }
}

/// Sink that records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Sink forwarding to the `metrics` crate facade.
#[cfg(feature = "metrics")]
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsEmitter;

#[cfg(feature = "metrics")]
impl MetricsSink for MetricsEmitter {
    fn workflow_started(&self, workflow_name: &str) {
        metrics::counter!("stepledger_workflows_started_total", "workflow" => workflow_name.to_string())
            .increment(1);
    }

    fn workflow_finished(&self, workflow_name: &str, outcome: &str, duration: Duration) {
        metrics::counter!(
            "stepledger_workflows_finished_total",
            "workflow" => workflow_name.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
        metrics::histogram!("stepledger_workflow_duration_seconds", "workflow" => workflow_name.to_string())
            .record(duration.as_secs_f64());
    }

    fn lease_acquisition(&self, workflow_name: &str, acquired: bool, duration: Duration) {
        metrics::counter!(
            "stepledger_lease_acquisitions_total",
            "workflow" => workflow_name.to_string(),
            "result" => if acquired { "acquired" } else { "locked" }
        )
        .increment(1);
        metrics::histogram!("stepledger_lease_acquire_seconds", "workflow" => workflow_name.to_string())
            .record(duration.as_secs_f64());
    }

    fn restore_completed(
        &self,
        workflow_name: &str,
        events_replayed: u64,
        had_snapshot: bool,
        duration: Duration,
    ) {
        metrics::counter!(
            "stepledger_restores_total",
            "workflow" => workflow_name.to_string(),
            "had_snapshot" => if had_snapshot { "true" } else { "false" }
        )
        .increment(1);
        metrics::histogram!("stepledger_restore_events_replayed", "workflow" => workflow_name.to_string())
            .record(events_replayed as f64);
        metrics::histogram!("stepledger_restore_seconds", "workflow" => workflow_name.to_string())
            .record(duration.as_secs_f64());
    }

    fn step_executed(
        &self,
        workflow_name: &str,
        step_name: &str,
        outcome: StepOutcome,
        duration_ms: u64,
        cached: bool,
    ) {
        metrics::counter!(
            "stepledger_steps_total",
            "workflow" => workflow_name.to_string(),
            "step" => step_name.to_string(),
            "outcome" => outcome.as_str(),
            "cached" => if cached { "true" } else { "false" }
        )
        .increment(1);
        metrics::histogram!(
            "stepledger_step_duration_ms",
            "workflow" => workflow_name.to_string(),
            "step" => step_name.to_string()
        )
        .record(duration_ms as f64);
    }

    fn step_retried(&self, workflow_name: &str, step_name: &str, attempt: i64) {
        let _ = attempt;
        metrics::counter!(
            "stepledger_step_retries_total",
            "workflow" => workflow_name.to_string(),
            "step" => step_name.to_string()
        )
        .increment(1);
    }

    fn snapshot_written(&self, workflow_name: &str, inline: bool) {
        metrics::counter!(
            "stepledger_snapshots_written_total",
            "workflow" => workflow_name.to_string(),
            "storage" => if inline { "inline" } else { "blob" }
        )
        .increment(1);
    }

    fn distill_executed(&self, workflow_name: &str, chunks: u64, failed: bool) {
        let _ = chunks;
        metrics::counter!(
            "stepledger_distills_total",
            "workflow" => workflow_name.to_string(),
            "result" => if failed { "failed" } else { "ok" }
        )
        .increment(1);
    }

    fn heartbeat_failed(&self, workflow_name: &str) {
        metrics::counter!("stepledger_heartbeat_failures_total", "workflow" => workflow_name.to_string())
            .increment(1);
    }
}
