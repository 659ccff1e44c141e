//! The engine: explicit wiring of the persistence kernel.
//!
//! [`Engine`] is a plain value constructed once at process start and cloned
//! wherever executions run; there is no process-wide singleton, so tests
//! substitute stores directly. It owns nothing mutable itself; all shared
//! state lives in the backing stores behind `Arc`s.
//!
//! # Examples
//!
//! ```
//! use stepledger::engine::Engine;
//!
//! # async fn example() {
//! let engine = Engine::in_memory();
//! assert_eq!(engine.config().snapshot_every, 10);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::idempotency::IdempotencyGuard;
use crate::journal::EventJournal;
use crate::leases::{LEASE_DURATION, LeaseManager};
use crate::recovery::HybridRecovery;
use crate::snapshots::SnapshotStore;
use crate::store::{BlobStore, MemoryBlobStore, MemoryStore, Store};
use crate::telemetry::{MetricsSink, NoopMetrics};

/// Engine-wide configuration knobs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Lease duration for single-writer ownership.
    pub lease_duration: Duration,
    /// Heartbeat cadence; `None` means lease duration / 10.
    pub heartbeat_interval: Option<Duration>,
    /// Snapshot after every N-th completed step.
    pub snapshot_every: u64,
    /// Validate checksums on reads and after replay.
    pub validate_checksums: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            heartbeat_interval: None,
            snapshot_every: 10,
            validate_checksums: true,
        }
    }
}

impl EngineConfig {
    /// Effective heartbeat cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.unwrap_or(self.lease_duration / 10)
    }
}

struct EngineInner {
    journal: EventJournal,
    snapshots: SnapshotStore,
    leases: LeaseManager,
    idempotency: IdempotencyGuard,
    recovery: HybridRecovery,
    config: EngineConfig,
    metrics: Arc<dyn MetricsSink>,
}

/// Handle over the persistence kernel. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Build an engine over explicit stores with default configuration.
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>) -> Self {
        Self::builder().store(store).blobs(blobs).build()
    }

    /// Fully in-memory engine for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryBlobStore::new()))
    }

    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn journal(&self) -> &EventJournal {
        &self.inner.journal
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.inner.snapshots
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.inner.leases
    }

    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.inner.idempotency
    }

    pub fn recovery(&self) -> &HybridRecovery {
        &self.inner.recovery
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.inner.metrics
    }

    /// Restore the latest state of a workflow. See
    /// [`HybridRecovery::restore`].
    pub async fn restore(
        &self,
        workflow_id: &str,
        org_id: &str,
    ) -> crate::recovery::Result<(crate::state::WorkflowState, i64)> {
        self.recovery().restore(workflow_id, org_id).await
    }

    /// Point-in-time restore. See [`HybridRecovery::restore_to`].
    pub async fn restore_to(
        &self,
        workflow_id: &str,
        org_id: &str,
        target_seq: i64,
    ) -> crate::recovery::Result<(crate::state::WorkflowState, i64)> {
        self.recovery()
            .restore_to(workflow_id, org_id, target_seq)
            .await
    }

    /// All savepoints recorded for a workflow, in journal order.
    pub async fn savepoints(
        &self,
        workflow_id: &str,
    ) -> crate::journal::Result<Vec<crate::events::Savepoint>> {
        use crate::events::{EventPayload, Savepoint, SavepointMetadata};
        let events = self.journal().events(workflow_id, -1, true).await?;
        Ok(events
            .into_iter()
            .filter_map(|event| match event.payload {
                EventPayload::SavepointCreated {
                    savepoint_id,
                    step_number,
                    goal_summary,
                    current_hypotheses,
                    open_questions,
                    decision_log,
                    next_step,
                    snapshot_ref,
                } => Some(Savepoint {
                    savepoint_id,
                    step_number,
                    event_seq: event.event_seq,
                    created_at: event.timestamp,
                    metadata: SavepointMetadata {
                        goal_summary,
                        hypotheses: current_hypotheses,
                        questions: open_questions,
                        decisions: decision_log,
                        next_step,
                    },
                    snapshot_ref,
                }),
                _ => None,
            })
            .collect())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn Store>>,
    blobs: Option<Arc<dyn BlobStore>>,
    config: Option<EngineConfig>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: impl MetricsSink + 'static) -> Self {
        self.metrics = Some(Arc::new(metrics));
        self
    }

    /// Assemble the engine. Missing stores default to in-memory backends.
    pub fn build(self) -> Engine {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let blobs = self
            .blobs
            .unwrap_or_else(|| Arc::new(MemoryBlobStore::new()) as Arc<dyn BlobStore>);
        let config = self.config.unwrap_or_default();
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));

        let journal = EventJournal::new(Arc::clone(&store));
        let snapshots = SnapshotStore::new(Arc::clone(&store), Arc::clone(&blobs));
        let leases = LeaseManager::with_duration(Arc::clone(&store), config.lease_duration);
        let idempotency = IdempotencyGuard::new(Arc::clone(&store), snapshots.clone());
        let recovery = HybridRecovery::new(journal.clone(), snapshots.clone())
            .with_validation(config.validate_checksums);

        Engine {
            inner: Arc::new(EngineInner {
                journal,
                snapshots,
                leases,
                idempotency,
                recovery,
                config,
                metrics,
            }),
        }
    }
}
