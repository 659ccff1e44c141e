//! The execution driver: workflow and step lifecycle protocol.
//!
//! A workflow invocation acquires the lease, restores or initializes
//! state, runs the user's future with the context installed, appends
//! `workflow.completed` on success, and releases the lease on the way out
//! (errors surface to the caller only after release).
//!
//! Each step runs the canonical protocol: cached-completion check →
//! attempt allocation → `step.intention` → user function → `step.completed`
//! with a state delta and an idempotent completion mark, or `step.failed`
//! and the retry policy. The intention event precedes the user effect, so
//! an intention without a matching completion marks an in-flight step that
//! a recovering executor may retry.

use std::time::Instant;

use serde_json::Value;
use tracing::instrument;

use crate::engine::Engine;
use crate::events::{Event, EventPayload, format_timestamp, utc_now_micros};
use crate::idempotency::IdempotencyError;
use crate::reasoning::execute_distill;
use crate::serialization::{JsonMap, compute_delta, to_canonical_json};
use crate::snapshots::INLINE_THRESHOLD;
use crate::state::WorkflowState;
use crate::store::StoreError;
use crate::telemetry::StepOutcome;

use super::config::{StepConfig, WorkflowOptions};
use super::context::ExecutionContext;
use super::{Result, StepError, WorkflowError};

impl WorkflowOptions {
    /// Whether any reasoning-sidecar feature is configured.
    pub(crate) fn sidecar_active(&self) -> bool {
        self.distill.is_some()
            || self.distill_every.is_some()
            || self.distill_threshold.is_some()
            || self.context_budget.is_some()
            || self.on_health_check.is_some()
    }
}

impl Engine {
    /// Run a workflow body under the engine's durability protocol.
    ///
    /// The body receives an [`ExecutionContext`] (also reachable through
    /// [`ExecutionContext::current`] on the same task) and calls
    /// [`ExecutionContext::step`] for each unit of side-effectful work.
    ///
    /// Returns the body's value, re-raises the last step failure when
    /// retries exhaust, or raises an engine error such as
    /// [`WorkflowError::Locked`].
    #[instrument(skip(self, options, body), fields(workflow = %options.workflow_name), err)]
    pub async fn run_workflow<F, Fut, T>(&self, options: WorkflowOptions, body: F) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let workflow_start = Instant::now();
        let ctx = ExecutionContext::prepare(self.clone(), options);
        let workflow_name = ctx.workflow_name().to_string();
        self.metrics().workflow_started(&workflow_name);

        let lease_start = Instant::now();
        let acquired = self
            .leases()
            .acquire(ctx.workflow_id(), ctx.org_id(), ctx.executor_id())
            .await?;
        let Some(lease) = acquired else {
            self.metrics()
                .lease_acquisition(&workflow_name, false, lease_start.elapsed());
            return Err(WorkflowError::Locked {
                workflow_id: ctx.workflow_id().to_string(),
            });
        };
        self.metrics()
            .lease_acquisition(&workflow_name, true, lease_start.elapsed());
        ctx.start_heartbeat(lease.clone());

        let result = self.drive(&ctx, body).await;

        ctx.stop_heartbeat();
        if let Err(error) = self.leases().release(&lease).await {
            tracing::warn!(%error, workflow_id = %ctx.workflow_id(), "lease release failed");
        }
        let outcome = if result.is_ok() { "completed" } else { "failed" };
        self.metrics()
            .workflow_finished(&workflow_name, outcome, workflow_start.elapsed());
        result
    }

    async fn drive<F, Fut, T>(&self, ctx: &ExecutionContext, body: F) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = ctx.current_lease();
        if ctx.is_resuming() {
            let restore_start = Instant::now();
            let (report, restored) = if ctx.inner.options.sidecar_active() {
                let (report, context) = self
                    .recovery()
                    .restore_report_with_context(ctx.workflow_id(), ctx.org_id())
                    .await?;
                (report, Some(context))
            } else {
                let report = self
                    .recovery()
                    .restore_report(ctx.workflow_id(), ctx.org_id())
                    .await?;
                (report, None)
            };
            self.metrics().restore_completed(
                ctx.workflow_name(),
                report.events_replayed,
                report.had_snapshot,
                restore_start.elapsed(),
            );
            let step_number = report.state.step_number;
            let last_event_seq = report.last_event_seq;
            ctx.install_state(report.state, last_event_seq);
            if let Some(context) = restored {
                ctx.install_restored(context);
            }
            let event = Event::new(
                ctx.workflow_id(),
                ctx.org_id(),
                EventPayload::WorkflowRestored {
                    step_number,
                    last_event_seq,
                },
            );
            let seq = ctx.append_fenced(event, lease.as_ref()).await?;
            ctx.note_seq(seq);
            tracing::info!(
                workflow_id = %ctx.workflow_id(),
                step_number,
                "workflow resumed"
            );
        } else {
            let started_at = format_timestamp(&utc_now_micros());
            let state = WorkflowState::from_started(
                ctx.workflow_id(),
                ctx.org_id(),
                ctx.workflow_name(),
                &started_at,
                &ctx.inner.options.tags,
            )?;
            let event = Event::new(
                ctx.workflow_id(),
                ctx.org_id(),
                EventPayload::WorkflowStarted {
                    workflow_name: ctx.workflow_name().to_string(),
                    tags: ctx.inner.options.tags.clone(),
                    started_at,
                },
            );
            let seq = ctx.append_fenced(event, lease.as_ref()).await?;
            ctx.install_state(state, seq);
            tracing::info!(workflow_id = %ctx.workflow_id(), "workflow started");
        }

        let out = match ctx.inner.options.max_duration {
            Some(limit) => {
                match tokio::time::timeout(limit, ctx.scope(body(ctx.clone()))).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(WorkflowError::DeadlineExceeded {
                            workflow_id: ctx.workflow_id().to_string(),
                            max_duration: limit,
                        });
                    }
                }
            }
            None => ctx.scope(body(ctx.clone())).await?,
        };

        let event = Event::new(
            ctx.workflow_id(),
            ctx.org_id(),
            EventPayload::WorkflowCompleted {},
        );
        let seq = ctx
            .append_fenced(event, ctx.current_lease().as_ref())
            .await?;
        ctx.note_seq(seq);
        tracing::info!(workflow_id = %ctx.workflow_id(), "workflow completed");
        Ok(out)
    }
}

impl ExecutionContext {
    /// Run a step with default configuration. See [`step_with`].
    ///
    /// [`step_with`]: ExecutionContext::step_with
    pub async fn step<F, Fut>(&self, name: &str, run: F) -> Result<JsonMap>
    where
        F: Fn(JsonMap) -> Fut,
        Fut: Future<Output = std::result::Result<JsonMap, StepError>>,
    {
        self.step_with(name, &StepConfig::new(), run).await
    }

    /// Run a unit of side-effectful work under the step protocol.
    ///
    /// `run` receives a clone of the current variables and returns the
    /// updates to merge into them. The step id is deterministic
    /// (`{name}_{counter}`), so a replayed workflow asks about exactly the
    /// same steps and cached completions short-circuit without re-running
    /// user code. Returns the variables of the post-step state.
    #[instrument(skip(self, config, run), fields(workflow_id = %self.workflow_id()), err)]
    pub async fn step_with<F, Fut>(
        &self,
        name: &str,
        config: &StepConfig,
        run: F,
    ) -> Result<JsonMap>
    where
        F: Fn(JsonMap) -> Fut,
        Fut: Future<Output = std::result::Result<JsonMap, StepError>>,
    {
        let step_id = {
            let mut cell = self.inner.cell.lock();
            cell.current_step_name = Some(name.to_string());
            config
                .idempotency_key
                .clone()
                .unwrap_or_else(|| format!("{name}_{}", cell.step_counter))
        };
        let workflow_name = self.workflow_name().to_string();
        let engine = self.engine().clone();
        let retry = config
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.options.retry.clone());

        loop {
            if self.lease_lost() {
                return Err(WorkflowError::LeaseLost {
                    workflow_id: self.workflow_id().to_string(),
                });
            }

            // Cached completion: skip the user code entirely.
            match engine
                .idempotency()
                .check_completed(self.workflow_id(), &step_id)
                .await
            {
                Ok(Some(cached)) => {
                    tracing::info!(%step_id, "step already completed; using cached result");
                    let seq = self.last_event_seq();
                    let variables = cached.variables.clone();
                    self.install_state(cached, seq);
                    engine.metrics().step_executed(
                        &workflow_name,
                        name,
                        StepOutcome::Completed,
                        0,
                        true,
                    );
                    return Ok(variables);
                }
                Ok(None) => {}
                Err(IdempotencyError::ResultCorruption { .. }) => {
                    // The completion row proves the step ran; the cached
                    // artifact is bad. Rebuild state from the journal
                    // rather than running the step a second time.
                    tracing::warn!(%step_id, "cached result corrupt; rebuilding from journal");
                    let (state, seq) = engine
                        .recovery()
                        .restore(self.workflow_id(), self.org_id())
                        .await?;
                    let variables = state.variables.clone();
                    self.install_state(state, seq);
                    engine.metrics().step_executed(
                        &workflow_name,
                        name,
                        StepOutcome::Completed,
                        0,
                        true,
                    );
                    return Ok(variables);
                }
                Err(other) => return Err(map_idempotency(self, other)),
            }

            let lease = self.current_lease();
            let attempt_id = match engine
                .idempotency()
                .allocate_attempt(
                    self.workflow_id(),
                    &step_id,
                    lease.as_ref().ok_or_else(|| WorkflowError::LeaseLost {
                        workflow_id: self.workflow_id().to_string(),
                    })?,
                )
                .await
            {
                Ok(attempt_id) => attempt_id,
                Err(error) => return Err(map_idempotency(self, error)),
            };

            let intention = Event::new(
                self.workflow_id(),
                self.org_id(),
                EventPayload::StepIntention {
                    step_id: step_id.clone(),
                    step_name: name.to_string(),
                    attempt_id,
                },
            );
            let seq = self.append_fenced(intention, lease.as_ref()).await?;
            self.note_seq(seq);

            let input = self.variables()?;
            let started = Instant::now();
            let outcome = match config.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, run(input)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout { timeout }),
                },
                None => run(input).await,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Err(error) => {
                    let failed = Event::new(
                        self.workflow_id(),
                        self.org_id(),
                        EventPayload::StepFailed {
                            step_id: step_id.clone(),
                            attempt_id,
                            error: error.to_string(),
                        },
                    );
                    let seq = self.append_fenced(failed, lease.as_ref()).await?;
                    self.note_seq(seq);
                    engine.metrics().step_executed(
                        &workflow_name,
                        name,
                        StepOutcome::Failed,
                        duration_ms,
                        false,
                    );
                    if retry.should_retry(attempt_id, &error) {
                        let backoff = retry.backoff(attempt_id);
                        tracing::info!(
                            %step_id,
                            attempt_id,
                            backoff_ms = backoff.as_millis() as u64,
                            "step failed; retrying"
                        );
                        engine
                            .metrics()
                            .step_retried(&workflow_name, name, attempt_id);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(WorkflowError::StepFailed {
                        step_id,
                        attempts: attempt_id,
                        source: error,
                    });
                }
                Ok(updates) => {
                    let output_size = to_canonical_json(&Value::Object(updates.clone())).len();
                    let (working, replay_base) = {
                        let cell = self.inner.cell.lock();
                        let working = cell.state.clone().ok_or_else(|| {
                            WorkflowError::StateUninitialized {
                                workflow_id: self.workflow_id().to_string(),
                            }
                        })?;
                        let base = cell.replay_base.clone().unwrap_or_else(|| working.clone());
                        (working, base)
                    };
                    let new_state = working.advanced(updates)?;
                    // The delta is computed against the replay base so that
                    // journal replay (which never sees un-journaled working
                    // mutations) reproduces the exact post-step state.
                    let delta =
                        compute_delta(&replay_base.to_document()?, &new_state.to_document()?);
                    let completed = Event::new(
                        self.workflow_id(),
                        self.org_id(),
                        EventPayload::StepCompleted {
                            step_id: step_id.clone(),
                            attempt_id,
                            state_delta: delta,
                            duration_ms,
                        },
                    );
                    let seq = self.append_fenced(completed, lease.as_ref()).await?;
                    if let Err(error) = engine
                        .idempotency()
                        .mark_completed(
                            self.workflow_id(),
                            &step_id,
                            attempt_id,
                            &new_state,
                            seq,
                        )
                        .await
                    {
                        return Err(map_idempotency(self, error));
                    }
                    let variables = new_state.variables.clone();
                    self.install_state(new_state.clone(), seq);
                    engine.metrics().step_executed(
                        &workflow_name,
                        name,
                        StepOutcome::Completed,
                        duration_ms,
                        false,
                    );

                    if config.checkpoint {
                        self.apply_snapshot_policy(&new_state, seq).await?;
                    }
                    if config.savepoint {
                        self.create_savepoint(None).await?;
                    }
                    self.post_step(output_size as u64, duration_ms, attempt_id > 1)
                        .await?;
                    return Ok(variables);
                }
            }
        }
    }

    /// Snapshot the state on the configured cadence.
    async fn apply_snapshot_policy(&self, state: &WorkflowState, seq: i64) -> Result<()> {
        let every = self.engine().config().snapshot_every;
        if every == 0 || state.step_number % every != 0 {
            return Ok(());
        }
        self.engine().snapshots().save(state, seq).await?;
        let inline = state.to_canonical_string()?.len() < INLINE_THRESHOLD;
        self.engine()
            .metrics()
            .snapshot_written(self.workflow_name(), inline);
        Ok(())
    }

    /// Post-step sidecar work: record health, fire the health hook, then
    /// evaluate distill triggers (so a hook-requested distill lands before
    /// the next step).
    async fn post_step(&self, output_size: u64, duration_ms: u64, was_retry: bool) -> Result<()> {
        {
            let mut cell = self.inner.cell.lock();
            cell.health.record_step(output_size, duration_ms, was_retry);
        }
        if let Some(hook) = self.inner.options.on_health_check.clone() {
            let health = self.context_health();
            hook(self.clone(), health).await;
        }
        self.maybe_distill().await
    }

    /// Evaluate distill triggers in order: explicit request, step interval,
    /// buffer threshold. Fires only when chunks are buffered.
    async fn maybe_distill(&self) -> Result<()> {
        let Some(distill) = self.inner.options.distill.clone() else {
            return Ok(());
        };

        let requested = self
            .inner
            .distill_requested
            .swap(false, std::sync::atomic::Ordering::SeqCst);
        let (triggered, step_number, chunks, previous) = {
            let mut cell = self.inner.cell.lock();
            let step_number = cell.state.as_ref().map_or(0, |s| s.step_number);
            let interval_hit = self.inner.options.distill_every.is_some_and(|every| {
                step_number.saturating_sub(cell.last_digest_step.unwrap_or(0)) >= every
            });
            let threshold_hit = self
                .inner
                .options
                .distill_threshold
                .is_some_and(|threshold| cell.buffer.total_chars() >= threshold);
            let triggered = requested || interval_hit || threshold_hit;
            if !triggered || cell.buffer.is_empty() {
                (false, step_number, Vec::new(), None)
            } else {
                let chunks = cell.buffer.clear();
                (true, step_number, chunks, cell.current_digest.clone())
            }
        };
        if !triggered {
            return Ok(());
        }

        let chunks_processed = chunks.len() as u64;
        let (digest, failed, error) = execute_distill(&distill, chunks.clone(), previous).await;
        let event = Event::new(
            self.workflow_id(),
            self.org_id(),
            EventPayload::ContextDigest {
                step_number,
                digest: if failed { Value::Null } else { digest.clone() },
                chunks_processed,
                distill_failed: failed,
                error,
                raw_chunks: if failed { chunks } else { Vec::new() },
            },
        );
        let seq = self
            .append_fenced(event, self.current_lease().as_ref())
            .await?;
        self.note_seq(seq);
        {
            let mut cell = self.inner.cell.lock();
            cell.current_digest = Some(digest);
            cell.digests_created += 1;
            cell.last_digest_step = Some(step_number);
        }
        self.engine()
            .metrics()
            .distill_executed(self.workflow_name(), chunks_processed, failed);
        tracing::info!(step_number, chunks_processed, failed, "distill cycle complete");
        Ok(())
    }
}

fn map_idempotency(ctx: &ExecutionContext, error: IdempotencyError) -> WorkflowError {
    match error {
        IdempotencyError::Store(StoreError::StaleFence { .. }) => WorkflowError::LeaseLost {
            workflow_id: ctx.workflow_id().to_string(),
        },
        other => WorkflowError::Idempotency(other),
    }
}
