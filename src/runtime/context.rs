//! The execution context of a running workflow.
//!
//! An [`ExecutionContext`] is a cheap-to-clone handle shared between the
//! driver and the user's workflow body. It carries the identity of the
//! invocation, the installed state, the held lease, and the reasoning
//! sidecar (buffer, health tracker, digest bookkeeping).
//!
//! The context is handed to the workflow body directly and also installed
//! in a tokio task-local, so helpers deep inside user code can reach it via
//! [`ExecutionContext::current`] without threading it through every
//! signature. Nested workflows on the same task are not supported; the
//! inner scope would shadow the outer context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::Engine;
use crate::events::{Event, EventPayload, SavepointMetadata};
use crate::leases::Lease;
use crate::reasoning::{ContextHealth, HealthTracker, ReasoningBuffer, RestoredContext};
use crate::serialization::JsonMap;
use crate::state::{SAVEPOINT_METADATA_KEY, WorkflowState};
use crate::store::StoreError;

use super::config::WorkflowOptions;
use super::{MAX_ANNOTATION_CHARS, Result, WorkflowError};

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// Mutable context cell, guarded by a sync mutex (never held across await).
pub(crate) struct ContextCell {
    /// Working state, including not-yet-journaled mutations.
    pub(crate) state: Option<WorkflowState>,
    /// State as of the last journaled event; step deltas diff against this
    /// so replay reproduces the exact post-step state.
    pub(crate) replay_base: Option<WorkflowState>,
    pub(crate) step_counter: u64,
    pub(crate) last_event_seq: i64,
    pub(crate) lease: Option<Lease>,
    pub(crate) heartbeat: Option<JoinHandle<()>>,
    pub(crate) current_step_name: Option<String>,
    pub(crate) buffer: ReasoningBuffer,
    pub(crate) health: HealthTracker,
    pub(crate) current_digest: Option<Value>,
    pub(crate) digests_created: u64,
    pub(crate) last_digest_step: Option<u64>,
    pub(crate) restored: Option<RestoredContext>,
}

pub(crate) struct ContextInner {
    pub(crate) workflow_id: String,
    pub(crate) org_id: String,
    pub(crate) executor_id: String,
    pub(crate) resuming: bool,
    pub(crate) engine: Engine,
    pub(crate) options: WorkflowOptions,
    pub(crate) cell: Mutex<ContextCell>,
    pub(crate) lease_lost: AtomicBool,
    pub(crate) distill_requested: AtomicBool,
}

/// Handle to a running workflow's execution context.
#[derive(Clone)]
pub struct ExecutionContext {
    pub(crate) inner: Arc<ContextInner>,
}

fn executor_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "executor".into());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

impl ExecutionContext {
    /// Build the context for one invocation. A supplied workflow id means
    /// resume; otherwise a fresh id is generated.
    pub(crate) fn prepare(engine: Engine, options: WorkflowOptions) -> Self {
        let (workflow_id, resuming) = match &options.workflow_id {
            Some(id) => (id.clone(), true),
            None => (format!("wf-{}", Uuid::new_v4()), false),
        };
        let org_id = options.org_id.clone();
        let owner = options.owner_id.clone().unwrap_or_else(executor_id);
        let health = HealthTracker::new(options.context_budget);
        Self {
            inner: Arc::new(ContextInner {
                workflow_id,
                org_id,
                executor_id: owner,
                resuming,
                engine,
                options,
                cell: Mutex::new(ContextCell {
                    state: None,
                    replay_base: None,
                    step_counter: 0,
                    last_event_seq: -1,
                    lease: None,
                    heartbeat: None,
                    current_step_name: None,
                    buffer: ReasoningBuffer::new(),
                    health,
                    current_digest: None,
                    digests_created: 0,
                    last_digest_step: None,
                    restored: None,
                }),
                lease_lost: AtomicBool::new(false),
                distill_requested: AtomicBool::new(false),
            }),
        }
    }

    /// The context of the workflow running on this task.
    ///
    /// Only resolves inside [`Engine::run_workflow`]; anywhere else this is
    /// [`WorkflowError::NoActiveWorkflow`].
    ///
    /// [`Engine::run_workflow`]: crate::engine::Engine::run_workflow
    pub fn current() -> Result<Self> {
        CURRENT
            .try_with(|ctx| ctx.clone())
            .map_err(|_| WorkflowError::NoActiveWorkflow)
    }

    /// Run `future` with this context installed in the task-local.
    pub(crate) async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT.scope(self.clone(), future).await
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn org_id(&self) -> &str {
        &self.inner.org_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.inner.options.workflow_name
    }

    pub fn executor_id(&self) -> &str {
        &self.inner.executor_id
    }

    /// Whether this invocation resumes an existing workflow.
    pub fn is_resuming(&self) -> bool {
        self.inner.resuming
    }

    /// The engine behind this context.
    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Sequence of the most recently journaled event.
    pub fn last_event_seq(&self) -> i64 {
        self.inner.cell.lock().last_event_seq
    }

    /// Snapshot of the current workflow state.
    pub fn state(&self) -> Result<WorkflowState> {
        self.inner
            .cell
            .lock()
            .state
            .clone()
            .ok_or_else(|| WorkflowError::StateUninitialized {
                workflow_id: self.inner.workflow_id.clone(),
            })
    }

    /// Clone of the current user variables.
    pub fn variables(&self) -> Result<JsonMap> {
        Ok(self.state()?.variables)
    }

    /// Set one workflow variable on the working state.
    ///
    /// The change is in-memory until the next completed step journals it as
    /// part of that step's delta.
    pub fn set_variable(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let mut cell = self.inner.cell.lock();
        let state = cell
            .state
            .take()
            .ok_or_else(|| WorkflowError::StateUninitialized {
                workflow_id: self.inner.workflow_id.clone(),
            })?;
        cell.state = Some(state.with_variable(key, value)?);
        Ok(())
    }

    /// Merge tags into the state metadata.
    pub fn update_tags(&self, tags: &rustc_hash::FxHashMap<String, String>) -> Result<()> {
        let mut cell = self.inner.cell.lock();
        let state = cell
            .state
            .take()
            .ok_or_else(|| WorkflowError::StateUninitialized {
                workflow_id: self.inner.workflow_id.clone(),
            })?;
        let mut tag_map = match state.metadata.get(crate::state::META_TAGS) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => JsonMap::new(),
        };
        for (key, value) in tags {
            tag_map.insert(key.clone(), Value::String(value.clone()));
        }
        cell.state =
            Some(state.with_metadata(crate::state::META_TAGS, Value::Object(tag_map))?);
        Ok(())
    }

    /// The context recovered on resume, if any.
    pub fn restored_context(&self) -> Option<RestoredContext> {
        self.inner.cell.lock().restored.clone()
    }

    /// Append a durable reasoning breadcrumb bound to the current step.
    ///
    /// One line; the engine stores it verbatim and never interprets it.
    /// Text beyond [`MAX_ANNOTATION_CHARS`] characters is rejected.
    pub async fn annotate(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let len = text.chars().count();
        if len > MAX_ANNOTATION_CHARS {
            return Err(WorkflowError::AnnotationTooLarge {
                len,
                max: MAX_ANNOTATION_CHARS,
            });
        }
        let (step_number, step_name, lease) = {
            let cell = self.inner.cell.lock();
            let step_number = cell.state.as_ref().map_or(0, |s| s.step_number);
            let step_name = cell
                .current_step_name
                .clone()
                .unwrap_or_else(|| format!("step_{step_number}"));
            (step_number, step_name, cell.lease.clone())
        };
        let event = Event::new(
            self.workflow_id(),
            self.org_id(),
            EventPayload::Annotation {
                step_number,
                step_name,
                text,
            },
        );
        let seq = self.append_fenced(event, lease.as_ref()).await?;
        self.note_seq(seq);
        Ok(())
    }

    /// Ingest a raw reasoning chunk: journal it and buffer it for the next
    /// distill cycle. Empty chunks are ignored.
    pub async fn ingest(&self, chunk: impl Into<String>) -> Result<()> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let chunk_size = chunk.len() as u64;
        let (step_number, lease) = {
            let mut cell = self.inner.cell.lock();
            cell.buffer.add(chunk.clone());
            cell.health.record_ingest(chunk_size);
            let step_number = cell.state.as_ref().map_or(0, |s| s.step_number);
            (step_number, cell.lease.clone())
        };
        let event = Event::new(
            self.workflow_id(),
            self.org_id(),
            EventPayload::ReasoningIngested {
                step_number,
                chunk,
                chunk_size,
            },
        );
        let seq = self.append_fenced(event, lease.as_ref()).await?;
        self.note_seq(seq);
        tracing::debug!(chunk_size, "reasoning chunk ingested");
        Ok(())
    }

    /// Compute the current health signals.
    pub fn context_health(&self) -> ContextHealth {
        let cell = self.inner.cell.lock();
        let current_step = cell.state.as_ref().map_or(0, |s| s.step_number);
        cell.health.compute(
            &cell.buffer,
            cell.digests_created,
            cell.last_digest_step,
            current_step,
        )
    }

    /// Request distillation before the next step runs.
    pub fn request_distill(&self) {
        self.inner.distill_requested.store(true, Ordering::SeqCst);
    }

    /// Append a savepoint event with epistemic metadata.
    ///
    /// Metadata comes from the argument, or from the
    /// `_savepoint_metadata` workflow variable when absent. Returns the
    /// savepoint id.
    pub async fn create_savepoint(&self, metadata: Option<SavepointMetadata>) -> Result<String> {
        let (state_meta, step_number, lease) = {
            let cell = self.inner.cell.lock();
            let from_state = cell
                .state
                .as_ref()
                .and_then(|s| s.variables.get(SAVEPOINT_METADATA_KEY))
                .and_then(|v| serde_json::from_value::<SavepointMetadata>(v.clone()).ok());
            let step_number = cell.state.as_ref().map_or(0, |s| s.step_number);
            (from_state, step_number, cell.lease.clone())
        };
        let metadata = metadata.or(state_meta).unwrap_or_default();
        let savepoint_id = Uuid::new_v4().to_string();
        let event = Event::new(
            self.workflow_id(),
            self.org_id(),
            EventPayload::SavepointCreated {
                savepoint_id: savepoint_id.clone(),
                step_number,
                goal_summary: metadata.goal_summary,
                current_hypotheses: metadata.hypotheses,
                open_questions: metadata.questions,
                decision_log: metadata.decisions,
                next_step: metadata.next_step,
                snapshot_ref: String::new(),
            },
        );
        let seq = self.append_fenced(event, lease.as_ref()).await?;
        self.note_seq(seq);
        tracing::info!(%savepoint_id, step_number, "savepoint created");
        Ok(savepoint_id)
    }

    // ------------------------------------------------------------------
    // Driver-side plumbing
    // ------------------------------------------------------------------

    /// Append an event under the current lease fence, translating stale
    /// fences into lease loss.
    pub(crate) async fn append_fenced(
        &self,
        event: Event,
        lease: Option<&Lease>,
    ) -> Result<i64> {
        if self.inner.lease_lost.load(Ordering::SeqCst) {
            return Err(WorkflowError::LeaseLost {
                workflow_id: self.inner.workflow_id.clone(),
            });
        }
        match self.engine().journal().append(event, lease).await {
            Ok(seq) => Ok(seq),
            Err(crate::journal::JournalError::Store(StoreError::StaleFence { .. })) => {
                self.inner.lease_lost.store(true, Ordering::SeqCst);
                Err(WorkflowError::LeaseLost {
                    workflow_id: self.inner.workflow_id.clone(),
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    pub(crate) fn note_seq(&self, seq: i64) {
        let mut cell = self.inner.cell.lock();
        if seq > cell.last_event_seq {
            cell.last_event_seq = seq;
        }
    }

    pub(crate) fn current_lease(&self) -> Option<Lease> {
        self.inner.cell.lock().lease.clone()
    }

    pub(crate) fn lease_lost(&self) -> bool {
        self.inner.lease_lost.load(Ordering::SeqCst)
    }

    /// Install a fresh or restored state as both working state and replay
    /// base, and derive the step counter from it.
    pub(crate) fn install_state(&self, state: WorkflowState, last_event_seq: i64) {
        let mut cell = self.inner.cell.lock();
        cell.step_counter = state.step_number;
        cell.replay_base = Some(state.clone());
        cell.state = Some(state);
        if last_event_seq > cell.last_event_seq {
            cell.last_event_seq = last_event_seq;
        }
    }

    /// Install the restored reasoning context and seed the health tracker.
    pub(crate) fn install_restored(&self, restored: RestoredContext) {
        let mut cell = self.inner.cell.lock();
        if let Some(digest) = &restored.digest {
            cell.current_digest = Some(digest.clone());
        }
        cell.digests_created = restored.digest_history.len() as u64;
        cell.last_digest_step = restored.digest_history.last().map(|d| d.step_number);
        cell.health.seed(
            &restored.step_durations,
            restored.total_output_bytes,
            restored.steps_completed,
        );
        cell.restored = Some(restored);
    }

    /// Start the background heartbeat task for the held lease.
    pub(crate) fn start_heartbeat(&self, lease: Lease) {
        let interval = self.engine().config().heartbeat_interval();
        let ctx = self.clone();
        let heartbeat_lease = lease.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the lease just
            // acquired is not instantly renewed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ctx.engine().leases().heartbeat(&heartbeat_lease).await {
                    Ok(_renewed) => {}
                    Err(error) => {
                        tracing::error!(
                            workflow_id = %heartbeat_lease.workflow_id,
                            %error,
                            "heartbeat failed; stopping step writes"
                        );
                        ctx.engine()
                            .metrics()
                            .heartbeat_failed(&ctx.inner.options.workflow_name);
                        ctx.inner.lease_lost.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        });
        let mut cell = self.inner.cell.lock();
        cell.lease = Some(lease);
        cell.heartbeat = Some(handle);
    }

    /// Stop the heartbeat task and drop the lease handle.
    pub(crate) fn stop_heartbeat(&self) {
        let handle = {
            let mut cell = self.inner.cell.lock();
            cell.lease = None;
            cell.heartbeat.take()
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workflow_id", &self.inner.workflow_id)
            .field("org_id", &self.inner.org_id)
            .field("executor_id", &self.inner.executor_id)
            .field("resuming", &self.inner.resuming)
            .finish()
    }
}
