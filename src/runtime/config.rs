//! Configuration values for workflow and step execution.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustc_hash::FxHashMap;

use crate::reasoning::{ContextHealth, DistillFn};
use crate::runtime::StepError;
use crate::runtime::context::ExecutionContext;

/// Async hook fired with the health snapshot after each completed step.
pub type HealthHook =
    Arc<dyn Fn(ExecutionContext, ContextHealth) -> BoxFuture<'static, ()> + Send + Sync>;

/// Predicate deciding whether a step failure is retryable.
pub type RetryPredicate = Arc<dyn Fn(&StepError) -> bool + Send + Sync>;

/// Retry policy for failed steps: bounded attempts with exponential
/// backoff and ±50% jitter.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub backoff_base: f64,
    pub backoff_max: f64,
    retry_if: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: 2.0,
            backoff_max: 60.0,
            retry_if: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("retry_if", &self.retry_if.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: f64, max: f64) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Restrict retries to failures matching `predicate`.
    #[must_use]
    pub fn retry_if(mut self, predicate: impl Fn(&StepError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Whether attempt number `attempt` (1-based) may be retried after
    /// `error`. On attempt `max_attempts` the failure is re-raised without
    /// a further backoff sleep.
    pub fn should_retry(&self, attempt: i64, error: &StepError) -> bool {
        attempt < self.max_attempts
            && self.retry_if.as_ref().is_none_or(|predicate| predicate(error))
    }

    /// Backoff before re-running attempt `attempt`:
    /// `min(base^attempt, max) * (0.5 + rand * 0.5)`.
    pub fn backoff(&self, attempt: i64) -> Duration {
        let exponent = attempt.clamp(0, 63) as i32;
        let delay = self.backoff_base.powi(exponent).min(self.backoff_max);
        let jittered = delay * (0.5 + rand::random::<f64>() * 0.5);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Per-step configuration.
#[derive(Clone, Debug)]
pub struct StepConfig {
    /// Apply the engine's snapshot cadence after this step (on by default).
    pub checkpoint: bool,
    /// Append a savepoint event with epistemic metadata after this step.
    pub savepoint: bool,
    /// Retry policy override; the workflow default applies when unset.
    pub retry: Option<RetryPolicy>,
    /// Wall-clock timeout for the user function.
    pub timeout: Option<Duration>,
    /// Explicit step identity for external side effects.
    ///
    /// Overrides the derived `{name}_{counter}` id, so a step whose
    /// identity is data-derived (say, `charge_order_1234`) completes at
    /// most once no matter where in the workflow it is called from.
    pub idempotency_key: Option<String>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            checkpoint: true,
            savepoint: false,
            retry: None,
            timeout: None,
            idempotency_key: None,
        }
    }
}

impl StepConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    #[must_use]
    pub fn with_savepoint(mut self, savepoint: bool) -> Self {
        self.savepoint = savepoint;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Options for one workflow invocation.
///
/// Supplying `workflow_id` requests a resume; omitting it starts a fresh
/// workflow under a generated id.
#[derive(Clone)]
pub struct WorkflowOptions {
    pub workflow_name: String,
    pub workflow_id: Option<String>,
    pub org_id: String,
    /// Executor identity for lease ownership; generated from the host name
    /// when not supplied by the invoker.
    pub owner_id: Option<String>,
    pub tags: FxHashMap<String, String>,
    /// Wall-clock bound on the whole invocation; expiry aborts the body
    /// and surfaces as a step-style timeout after the lease is released.
    pub max_duration: Option<Duration>,
    /// Default retry policy for steps without an override.
    pub retry: RetryPolicy,
    /// Developer-provided distill function; enables the reasoning sidecar's
    /// digest cycle.
    pub distill: Option<DistillFn>,
    /// Distill every N completed steps.
    pub distill_every: Option<u64>,
    /// Distill when the reasoning buffer exceeds this many chars.
    pub distill_threshold: Option<usize>,
    /// Context budget in bytes for health accounting.
    pub context_budget: Option<u64>,
    /// Hook fired with health signals after each step.
    pub on_health_check: Option<HealthHook>,
}

impl std::fmt::Debug for WorkflowOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOptions")
            .field("workflow_name", &self.workflow_name)
            .field("workflow_id", &self.workflow_id)
            .field("org_id", &self.org_id)
            .field("owner_id", &self.owner_id)
            .field("tags", &self.tags)
            .field("max_duration", &self.max_duration)
            .field("retry", &self.retry)
            .field("distill", &self.distill.as_ref().map(|_| "<fn>"))
            .field("distill_every", &self.distill_every)
            .field("distill_threshold", &self.distill_threshold)
            .field("context_budget", &self.context_budget)
            .finish()
    }
}

impl WorkflowOptions {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            workflow_id: None,
            org_id: "default".into(),
            owner_id: None,
            tags: FxHashMap::default(),
            max_duration: None,
            retry: RetryPolicy::default(),
            distill: None,
            distill_every: None,
            distill_threshold: None,
            context_budget: None,
            on_health_check: None,
        }
    }

    /// Resume (or pin the id of) a specific workflow.
    #[must_use]
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    #[must_use]
    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = org_id.into();
        self
    }

    #[must_use]
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_distill(mut self, distill: DistillFn) -> Self {
        self.distill = Some(distill);
        self
    }

    #[must_use]
    pub fn with_distill_every(mut self, steps: u64) -> Self {
        self.distill_every = Some(steps);
        self
    }

    #[must_use]
    pub fn with_distill_threshold(mut self, chars: usize) -> Self {
        self.distill_threshold = Some(chars);
        self
    }

    #[must_use]
    pub fn with_context_budget(mut self, bytes: u64) -> Self {
        self.context_budget = Some(bytes);
        self
    }

    #[must_use]
    pub fn with_health_hook(mut self, hook: HealthHook) -> Self {
        self.on_health_check = Some(hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_up_to_max() {
        let policy = RetryPolicy::default();
        let error = StepError::msg("boom");
        assert!(policy.should_retry(1, &error));
        assert!(policy.should_retry(2, &error));
        assert!(!policy.should_retry(3, &error));
    }

    #[test]
    fn predicate_limits_retries() {
        let policy = RetryPolicy::default()
            .retry_if(|e| matches!(e, StepError::Timeout { .. }));
        assert!(!policy.should_retry(1, &StepError::msg("not retryable")));
        assert!(policy.should_retry(
            1,
            &StepError::Timeout {
                timeout: Duration::from_secs(1)
            }
        ));
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let policy = RetryPolicy::default().with_backoff(2.0, 60.0);
        for attempt in 1..=10 {
            let delay = policy.backoff(attempt).as_secs_f64();
            let raw = 2.0_f64.powi(attempt as i32).min(60.0);
            assert!(delay >= raw * 0.5 - 1e-9, "attempt {attempt}: {delay}");
            assert!(delay <= raw + 1e-9, "attempt {attempt}: {delay}");
        }
    }
}
