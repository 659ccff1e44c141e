//! Idempotency guard: at most one durable completion per step.
//!
//! Each step execution first asks whether the step already completed (and
//! gets the cached result state back if so), then allocates a unique
//! attempt id under the current lease fence. Completion is recorded with a
//! conflict-ignoring insert so racing marks are harmless, together with a
//! checksummed result snapshot for cached replay.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::events::utc_now_micros;
use crate::leases::Lease;
use crate::serialization::sha256_hex;
use crate::snapshots::{SnapshotError, SnapshotStore};
use crate::state::WorkflowState;
use crate::store::{CompletionRecord, Store, StoreError};

/// Upper bound on attempt ids probed before giving up.
pub const MAX_ATTEMPTS: i64 = 100;

/// Errors from the idempotency guard.
#[derive(Debug, Error, Diagnostic)]
pub enum IdempotencyError {
    /// The attempt id space for a step is exhausted.
    #[error("too many attempts for {workflow_id}/{step_id} (limit {limit})")]
    #[diagnostic(
        code(stepledger::idempotency::too_many_attempts),
        help("Pathological contention or a looping executor; inspect the step_attempts rows.")
    )]
    TooManyAttempts {
        workflow_id: String,
        step_id: String,
        limit: i64,
    },

    /// The cached result snapshot no longer matches its recorded checksum.
    #[error("cached result for {workflow_id}/{step_id} failed checksum validation")]
    #[diagnostic(
        code(stepledger::idempotency::result_corruption),
        help("Treat the cached result as missing and rebuild state via journal replay.")
    )]
    ResultCorruption { workflow_id: String, step_id: String },

    #[error(transparent)]
    #[diagnostic(code(stepledger::idempotency::encoding))]
    Serialization(#[from] crate::serialization::SerializationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Guard over the `step_attempts` and `completed_steps` tables.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn Store>,
    snapshots: SnapshotStore,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn Store>, snapshots: SnapshotStore) -> Self {
        Self { store, snapshots }
    }

    /// Allocate the smallest free attempt id (≥ 1) for a step.
    ///
    /// Insertion races surface as unique-constraint conflicts and move on
    /// to the next candidate; the probe is bounded by [`MAX_ATTEMPTS`].
    /// The attempt row records the lease's fencing token, and the insert
    /// itself is fenced, so a stale executor cannot allocate.
    #[instrument(skip(self, lease), err)]
    pub async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        lease: &Lease,
    ) -> Result<i64> {
        let fence = lease.fence();
        for attempt_id in 1..=MAX_ATTEMPTS {
            let inserted = self
                .store
                .insert_attempt(workflow_id, step_id, attempt_id, utc_now_micros(), &fence)
                .await?;
            if inserted {
                return Ok(attempt_id);
            }
        }
        Err(IdempotencyError::TooManyAttempts {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            limit: MAX_ATTEMPTS,
        })
    }

    /// Return the cached result state if the step already completed.
    ///
    /// The referenced result snapshot is loaded and verified against the
    /// completion row's checksum; a mismatch is
    /// [`IdempotencyError::ResultCorruption`] and the caller falls back to
    /// journal replay.
    #[instrument(skip(self), err)]
    pub async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<WorkflowState>> {
        let Some(completion) = self.store.completion(workflow_id, step_id).await? else {
            return Ok(None);
        };
        let state = match self.snapshots.load(&completion.result_snapshot_ref).await {
            Ok(state) => state,
            Err(SnapshotError::SnapshotCorruption { .. } | SnapshotError::NotFound { .. }) => {
                return Err(IdempotencyError::ResultCorruption {
                    workflow_id: workflow_id.to_string(),
                    step_id: step_id.to_string(),
                });
            }
            Err(other) => return Err(other.into()),
        };
        let checksum = sha256_hex(state.to_canonical_string()?.as_bytes());
        if checksum != completion.result_checksum {
            return Err(IdempotencyError::ResultCorruption {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
            });
        }
        Ok(Some(state))
    }

    /// Record a step completion (idempotent).
    ///
    /// Saves a result snapshot at `last_event_seq` (the completion event's
    /// assigned sequence), then inserts the completion row with
    /// conflict-ignore semantics so only the first mark sticks.
    #[instrument(skip(self, state), err)]
    pub async fn mark_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
        attempt_id: i64,
        state: &WorkflowState,
        last_event_seq: i64,
    ) -> Result<String> {
        let snapshot_ref = self.snapshots.save(state, last_event_seq).await?;
        let result_checksum = sha256_hex(state.to_canonical_string()?.as_bytes());
        let record = CompletionRecord {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempt_id,
            completed_at: utc_now_micros(),
            result_snapshot_ref: snapshot_ref.clone(),
            result_checksum,
        };
        self.store.insert_completion(&record).await?;
        Ok(snapshot_ref)
    }
}
