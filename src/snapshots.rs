//! Snapshot store: materialized state with inline/blob hybrid storage.
//!
//! A snapshot captures the full [`WorkflowState`] at a journal position.
//! Serialized states under [`INLINE_THRESHOLD`] bytes live inline in the
//! relational row; larger ones go to the blob store under
//! `snapshots/{workflow_id}/{snapshot_id}` and the row keeps the key.
//! Loads always revalidate the checksum.
//!
//! Snapshots are advisory performance aids; recovery falls back to journal
//! replay whenever one is missing or corrupt.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::events::utc_now_micros;
use crate::serialization::sha256_hex;
use crate::state::WorkflowState;
use crate::store::{BlobStore, SnapshotRecord, Store, StoreError, blob::BlobError};

/// Serialized states below this many bytes are stored inline.
pub const INLINE_THRESHOLD: usize = 100_000;

/// Errors from snapshot operations.
#[derive(Debug, Error, Diagnostic)]
pub enum SnapshotError {
    /// No snapshot row under the requested id.
    #[error("snapshot not found: {snapshot_id}")]
    #[diagnostic(code(stepledger::snapshots::not_found))]
    NotFound { snapshot_id: String },

    /// Stored bytes no longer match the recorded checksum.
    #[error("snapshot {snapshot_id} failed checksum validation")]
    #[diagnostic(
        code(stepledger::snapshots::corruption),
        help("Treat the snapshot as missing; recovery replays the journal instead.")
    )]
    SnapshotCorruption { snapshot_id: String },

    /// A snapshot row references neither inline bytes nor a blob key.
    #[error("snapshot {snapshot_id} has no payload reference")]
    #[diagnostic(code(stepledger::snapshots::empty_row))]
    EmptyRow { snapshot_id: String },

    #[error(transparent)]
    #[diagnostic(code(stepledger::snapshots::encoding))]
    Serialization(#[from] crate::serialization::SerializationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Blob(#[from] BlobError),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Handle over snapshot rows plus the blob store for oversized payloads.
#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Persist `state` as of journal position `last_event_seq`.
    ///
    /// Returns the new snapshot id.
    #[instrument(skip(self, state), fields(workflow_id = %state.workflow_id, step = state.step_number), err)]
    pub async fn save(&self, state: &WorkflowState, last_event_seq: i64) -> Result<String> {
        let snapshot_id = Uuid::new_v4().to_string();
        let serialized = state.to_canonical_string()?;
        let bytes = serialized.into_bytes();
        let checksum = sha256_hex(&bytes);

        let (state_inline, state_blob_key) = if bytes.len() < INLINE_THRESHOLD {
            (Some(bytes), None)
        } else {
            let key = format!("snapshots/{}/{}", state.workflow_id, snapshot_id);
            self.blobs.put(&key, &bytes).await?;
            (None, Some(key))
        };

        let record = SnapshotRecord {
            snapshot_id: snapshot_id.clone(),
            workflow_id: state.workflow_id.clone(),
            org_id: state.org_id.clone(),
            step_number: state.step_number,
            last_event_seq,
            state_inline,
            state_blob_key,
            state_checksum: checksum,
            created_at: utc_now_micros(),
        };
        self.store.insert_snapshot(&record).await?;
        tracing::debug!(%snapshot_id, last_event_seq, "snapshot saved");
        Ok(snapshot_id)
    }

    /// Load and checksum-validate a snapshot by id.
    #[instrument(skip(self), err)]
    pub async fn load(&self, snapshot_id: &str) -> Result<WorkflowState> {
        let record = self
            .store
            .snapshot(snapshot_id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound {
                snapshot_id: snapshot_id.to_string(),
            })?;
        self.materialize(&record).await
    }

    /// The newest snapshot for a workflow, with its journal position.
    #[instrument(skip(self), err)]
    pub async fn latest(
        &self,
        workflow_id: &str,
        org_id: &str,
    ) -> Result<Option<(WorkflowState, i64)>> {
        match self.store.latest_snapshot(workflow_id, org_id).await? {
            Some(record) => {
                let seq = record.last_event_seq;
                Ok(Some((self.materialize(&record).await?, seq)))
            }
            None => Ok(None),
        }
    }

    /// The newest snapshot at or before `target_seq`.
    #[instrument(skip(self), err)]
    pub async fn at_seq(
        &self,
        workflow_id: &str,
        org_id: &str,
        target_seq: i64,
    ) -> Result<Option<(WorkflowState, i64)>> {
        match self
            .store
            .snapshot_at(workflow_id, org_id, target_seq)
            .await?
        {
            Some(record) => {
                let seq = record.last_event_seq;
                Ok(Some((self.materialize(&record).await?, seq)))
            }
            None => Ok(None),
        }
    }

    async fn materialize(&self, record: &SnapshotRecord) -> Result<WorkflowState> {
        let bytes = match (&record.state_inline, &record.state_blob_key) {
            (Some(inline), _) => inline.clone(),
            (None, Some(key)) => self.blobs.get(key).await?,
            (None, None) => {
                return Err(SnapshotError::EmptyRow {
                    snapshot_id: record.snapshot_id.clone(),
                });
            }
        };
        if sha256_hex(&bytes) != record.state_checksum {
            return Err(SnapshotError::SnapshotCorruption {
                snapshot_id: record.snapshot_id.clone(),
            });
        }
        let doc = serde_json::from_slice(&bytes).map_err(|source| {
            SnapshotError::Serialization(crate::serialization::SerializationError::Encode {
                source,
            })
        })?;
        Ok(WorkflowState::from_document(doc)?)
    }
}
