//! Reasoning-context preservation: buffers, health signals, digests.
//!
//! The engine is plumbing here, not policy. It accumulates raw reasoning
//! chunks, measures execution health without interpreting it, and calls a
//! developer-supplied distill function to compress chunks into an opaque
//! digest. What a digest *means* is entirely the developer's business.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};

/// Boxed error type for developer-supplied hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Developer-supplied distill function.
///
/// Receives the buffered chunks and the previous digest (if any) and
/// returns the new digest as opaque JSON. Async because distillation
/// usually wraps a model call.
pub type DistillFn = Arc<
    dyn Fn(Vec<String>, Option<Value>) -> BoxFuture<'static, std::result::Result<Value, HookError>>
        + Send
        + Sync,
>;

/// Accumulates raw reasoning chunks between distillations.
#[derive(Clone, Debug, Default)]
pub struct ReasoningBuffer {
    chunks: Vec<String>,
    total_chars: usize,
}

impl ReasoningBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        self.total_chars += chunk.chars().count();
        self.chunks.push(chunk);
    }

    /// Drain the buffer, returning the accumulated chunks.
    pub fn clear(&mut self) -> Vec<String> {
        self.total_chars = 0;
        std::mem::take(&mut self.chunks)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }
}

/// Direction of a windowed metric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    #[default]
    Stable,
    Declining,
    Increasing,
}

/// Action the health signals point at. A signal, not a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Distill,
    Savepoint,
}

/// Health signals computed from recent step execution metrics.
///
/// The engine measures; the developer decides what counts as a warning.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ContextHealth {
    /// Step output sizes in the trend window, oldest first.
    pub output_sizes: Vec<u64>,
    pub output_trend: Trend,
    /// Step durations (ms) in the trend window, oldest first.
    pub step_durations: Vec<u64>,
    pub duration_trend: Trend,
    pub retry_count: u64,
    /// Retries divided by total steps.
    pub retry_rate: f64,
    pub total_output_bytes: u64,
    pub budget_limit: Option<u64>,
    /// Fraction of the context budget consumed (0.0 when no budget).
    pub budget_used: f64,
    pub reasoning_buffer_size: usize,
    pub reasoning_buffer_chars: usize,
    pub digests_created: u64,
    pub last_digest_step: Option<u64>,
    pub steps_since_digest: u64,
    pub recommendation: Option<Recommendation>,
}

/// Buffer size past which the health signal recommends distilling.
const DISTILL_BUFFER_CHARS: usize = 5000;
/// Budget fraction past which the health signal recommends distilling.
const DISTILL_BUDGET_FRACTION: f64 = 0.8;
/// Retry rate past which declining output recommends a savepoint.
const SAVEPOINT_RETRY_RATE: f64 = 0.2;

/// Tracks execution metrics and computes [`ContextHealth`].
#[derive(Clone, Debug)]
pub struct HealthTracker {
    output_sizes: Vec<u64>,
    step_durations: Vec<u64>,
    retry_count: u64,
    total_steps: u64,
    total_output_bytes: u64,
    context_budget: Option<u64>,
}

impl HealthTracker {
    /// Window size for trend calculation.
    pub const TREND_WINDOW: usize = 10;

    #[must_use]
    pub fn new(context_budget: Option<u64>) -> Self {
        Self {
            output_sizes: Vec::new(),
            step_durations: Vec::new(),
            retry_count: 0,
            total_steps: 0,
            total_output_bytes: 0,
            context_budget,
        }
    }

    /// Record metrics from a completed step.
    pub fn record_step(&mut self, output_size: u64, duration_ms: u64, was_retry: bool) {
        self.output_sizes.push(output_size);
        self.step_durations.push(duration_ms);
        self.total_output_bytes += output_size;
        self.total_steps += 1;
        if was_retry {
            self.retry_count += 1;
        }
    }

    /// Count ingested reasoning bytes against the context budget.
    pub fn record_ingest(&mut self, chunk_bytes: u64) {
        self.total_output_bytes += chunk_bytes;
    }

    /// Seed the tracker from stats recovered on resume.
    pub fn seed(&mut self, durations: &[u64], total_output_bytes: u64, steps_completed: u64) {
        self.step_durations = durations.to_vec();
        self.total_output_bytes = total_output_bytes;
        self.total_steps = steps_completed;
    }

    /// Compute the current health snapshot.
    pub fn compute(
        &self,
        buffer: &ReasoningBuffer,
        digests_created: u64,
        last_digest_step: Option<u64>,
        current_step: u64,
    ) -> ContextHealth {
        let window = |values: &[u64]| -> Vec<u64> {
            let start = values.len().saturating_sub(Self::TREND_WINDOW);
            values[start..].to_vec()
        };
        let budget_used = self
            .context_budget
            .map(|budget| self.total_output_bytes as f64 / budget.max(1) as f64)
            .unwrap_or(0.0);
        let mut health = ContextHealth {
            output_sizes: window(&self.output_sizes),
            output_trend: trend_of(&self.output_sizes),
            step_durations: window(&self.step_durations),
            duration_trend: trend_of(&self.step_durations),
            retry_count: self.retry_count,
            retry_rate: self.retry_count as f64 / self.total_steps.max(1) as f64,
            total_output_bytes: self.total_output_bytes,
            budget_limit: self.context_budget,
            budget_used,
            reasoning_buffer_size: buffer.len(),
            reasoning_buffer_chars: buffer.total_chars(),
            digests_created,
            last_digest_step,
            steps_since_digest: match last_digest_step {
                Some(last) => current_step.saturating_sub(last),
                None => current_step,
            },
            recommendation: None,
        };
        health.recommendation = recommend(&health);
        health
    }
}

/// Least-squares slope of the last window, normalized by the mean.
/// A relative slope beyond ±0.1 counts as a non-stable trend.
fn trend_of(values: &[u64]) -> Trend {
    let start = values.len().saturating_sub(HealthTracker::TREND_WINDOW);
    let recent = &values[start..];
    if recent.len() < 3 {
        return Trend::Stable;
    }
    let n = recent.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = recent.iter().sum::<u64>() as f64 / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &y) in recent.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (y as f64 - y_mean);
        denominator += dx * dx;
    }
    if denominator == 0.0 || y_mean == 0.0 {
        return Trend::Stable;
    }
    let relative_slope = (numerator / denominator) / y_mean;
    if relative_slope < -0.1 {
        Trend::Declining
    } else if relative_slope > 0.1 {
        Trend::Increasing
    } else {
        Trend::Stable
    }
}

fn recommend(health: &ContextHealth) -> Option<Recommendation> {
    if health.reasoning_buffer_chars > DISTILL_BUFFER_CHARS
        || (health.budget_limit.is_some() && health.budget_used > DISTILL_BUDGET_FRACTION)
    {
        return Some(Recommendation::Distill);
    }
    if health.output_trend == Trend::Declining && health.retry_rate > SAVEPOINT_RETRY_RATE {
        return Some(Recommendation::Savepoint);
    }
    None
}

/// One digest entry recovered from the journal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DigestEntry {
    pub step_number: u64,
    pub digest: Value,
    pub chunks_processed: u64,
    pub distill_failed: bool,
}

/// One annotation recovered from the journal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnotationEntry {
    pub step_number: u64,
    pub step_name: String,
    pub text: String,
}

/// Raw materials handed back alongside state on restore.
///
/// The engine does not reconstruct a context window; it returns what it
/// durably kept and lets the developer rebuild their prompt from it.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RestoredContext {
    /// Latest digest (a failed-fallback object when the last distill
    /// failed, raw chunks included).
    pub digest: Option<Value>,
    /// Chunks ingested after the last digest event.
    pub undigested: Vec<String>,
    /// Step-associated annotations, in journal order.
    pub annotations: Vec<AnnotationEntry>,
    /// Full digest history for the audit trail.
    pub digest_history: Vec<DigestEntry>,
    /// Savepoint payloads, in journal order.
    pub savepoints: Vec<Value>,
    pub steps_completed: u64,
    pub total_output_bytes: u64,
    pub step_durations: Vec<u64>,
}

/// Run the developer's distill function, never letting it fail the workflow.
///
/// On error the returned digest is a fallback object that preserves the raw
/// chunks, so no data is lost and execution continues.
pub async fn execute_distill(
    distill: &DistillFn,
    chunks: Vec<String>,
    previous_digest: Option<Value>,
) -> (Value, bool, String) {
    match distill(chunks.clone(), previous_digest).await {
        Ok(digest) => (digest, false, String::new()),
        Err(error) => {
            let message = error.to_string();
            tracing::warn!(%message, "distill function failed; preserving raw chunks");
            let fallback = json!({
                "distill_failed": true,
                "error": message,
                "raw_chunks": chunks,
            });
            (fallback, true, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_accumulates_and_clears() {
        let mut buffer = ReasoningBuffer::new();
        buffer.add("abc");
        buffer.add("defgh");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_chars(), 8);
        let chunks = buffer.clear();
        assert_eq!(chunks, vec!["abc".to_string(), "defgh".to_string()]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_chars(), 0);
    }

    #[test]
    fn short_series_is_stable() {
        assert_eq!(trend_of(&[10, 20]), Trend::Stable);
        assert_eq!(trend_of(&[]), Trend::Stable);
    }

    #[test]
    fn monotone_series_trend() {
        assert_eq!(trend_of(&[100, 80, 60, 40, 20]), Trend::Declining);
        assert_eq!(trend_of(&[20, 40, 60, 80, 100]), Trend::Increasing);
        assert_eq!(trend_of(&[50, 50, 50, 50, 50]), Trend::Stable);
    }

    #[test]
    fn buffer_threshold_recommends_distill() {
        let tracker = HealthTracker::new(None);
        let mut buffer = ReasoningBuffer::new();
        buffer.add("x".repeat(6000));
        let health = tracker.compute(&buffer, 0, None, 3);
        assert_eq!(health.recommendation, Some(Recommendation::Distill));
    }

    #[test]
    fn budget_pressure_recommends_distill() {
        let mut tracker = HealthTracker::new(Some(1000));
        tracker.record_step(500, 10, false);
        tracker.record_ingest(400);
        let buffer = ReasoningBuffer::new();
        let health = tracker.compute(&buffer, 0, None, 1);
        assert!(health.budget_used > 0.8);
        assert_eq!(health.recommendation, Some(Recommendation::Distill));
    }

    #[test]
    fn declining_output_with_retries_recommends_savepoint() {
        let mut tracker = HealthTracker::new(None);
        for (i, size) in [1000u64, 800, 600, 400, 200].iter().enumerate() {
            tracker.record_step(*size, 10, i % 2 == 0);
        }
        let buffer = ReasoningBuffer::new();
        let health = tracker.compute(&buffer, 0, None, 5);
        assert_eq!(health.output_trend, Trend::Declining);
        assert!(health.retry_rate > 0.2);
        assert_eq!(health.recommendation, Some(Recommendation::Savepoint));
    }

    #[test]
    fn steps_since_digest_counts_from_start_without_digests() {
        let tracker = HealthTracker::new(None);
        let buffer = ReasoningBuffer::new();
        let health = tracker.compute(&buffer, 0, None, 7);
        assert_eq!(health.steps_since_digest, 7);
        let health = tracker.compute(&buffer, 2, Some(5), 7);
        assert_eq!(health.steps_since_digest, 2);
    }

    #[tokio::test]
    async fn failed_distill_preserves_chunks() {
        let distill: DistillFn =
            Arc::new(|_chunks, _prev| Box::pin(async { Err("model unavailable".into()) }));
        let chunks = vec!["c1".to_string(), "c2".to_string()];
        let (digest, failed, error) = execute_distill(&distill, chunks, None).await;
        assert!(failed);
        assert_eq!(error, "model unavailable");
        assert_eq!(digest["raw_chunks"][1], "c2");
        assert_eq!(digest["distill_failed"], true);
    }
}
