//! Ready-made health-check hooks.
//!
//! These are ten-line policies, not framework code: the engine stays dumb
//! and these show what "smart" looks like. Wire one in with
//! [`WorkflowOptions::with_health_hook`](crate::runtime::WorkflowOptions::with_health_hook),
//! or copy and modify for your use case.

use std::sync::Arc;

use crate::events::SavepointMetadata;
use crate::reasoning::{Recommendation, Trend};
use crate::runtime::HealthHook;

/// Distill when the output trend declines and chunks are buffered.
///
/// Declining output often means the agent is losing detail as its context
/// degrades; distilling preserves the reasoning while it is still there.
pub fn distill_on_decline() -> HealthHook {
    Arc::new(|ctx, health| {
        Box::pin(async move {
            if health.output_trend == Trend::Declining && health.reasoning_buffer_size > 0 {
                tracing::info!("output declining; requesting distillation");
                ctx.request_distill();
            }
        })
    })
}

/// Create a savepoint when the retry rate spikes.
///
/// A struggling agent is about to get worse; capture the current reasoning
/// state before it does.
pub fn savepoint_on_drift() -> HealthHook {
    Arc::new(|ctx, health| {
        Box::pin(async move {
            if health.retry_rate > 0.2 {
                tracing::info!(retry_rate = health.retry_rate, "retry rate elevated; saving");
                let metadata = SavepointMetadata {
                    goal_summary: "Savepoint due to elevated retry rate".into(),
                    questions: vec!["Why is the retry rate elevated?".into()],
                    next_step: "Investigate failures".into(),
                    ..SavepointMetadata::default()
                };
                if let Err(error) = ctx.create_savepoint(Some(metadata)).await {
                    tracing::warn!(%error, "savepoint hook failed");
                }
            }
        })
    })
}

/// Log a warning at 80% of the context budget. Visibility only; takes no
/// action.
pub fn warn_on_budget() -> HealthHook {
    Arc::new(|_ctx, health| {
        Box::pin(async move {
            if health.budget_used > 0.8 {
                tracing::warn!(
                    budget_used = health.budget_used,
                    total_output_bytes = health.total_output_bytes,
                    "context budget nearly exhausted"
                );
            }
        })
    })
}

/// Distill and annotate as the budget limit approaches.
///
/// More aggressive than [`warn_on_budget`]: compresses context at 70% and
/// flags the workflow to wrap up at 90%.
pub fn distill_and_annotate_on_budget() -> HealthHook {
    Arc::new(|ctx, health| {
        Box::pin(async move {
            if health.budget_used > 0.9 {
                if let Err(error) = ctx
                    .annotate("Approaching context budget limit, wrapping up")
                    .await
                {
                    tracing::warn!(%error, "budget annotation failed");
                }
                if let Err(error) = ctx.set_variable("should_conclude", serde_json::json!(true)) {
                    tracing::warn!(%error, "budget flag failed");
                }
                if health.reasoning_buffer_size > 0 {
                    ctx.request_distill();
                }
            } else if health.budget_used > 0.7 && health.reasoning_buffer_size > 0 {
                ctx.request_distill();
            }
        })
    })
}

/// Apply every recommendation the health signals produce: distill on
/// distill, savepoint on savepoint.
pub fn follow_recommendations() -> HealthHook {
    Arc::new(|ctx, health| {
        Box::pin(async move {
            match health.recommendation {
                Some(Recommendation::Distill) => ctx.request_distill(),
                Some(Recommendation::Savepoint) => {
                    if let Err(error) = ctx.create_savepoint(None).await {
                        tracing::warn!(%error, "savepoint hook failed");
                    }
                }
                None => {}
            }
        })
    })
}
