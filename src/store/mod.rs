//! Persistence contracts for the engine's backing stores.
//!
//! Two seams separate the engine from its storage:
//!
//! - [`Store`] is the relational contract: journal rows with atomic
//!   per-workflow sequence allocation, snapshot rows, lease rows with
//!   fencing tokens, step attempts, and step completions.
//! - [`BlobStore`] holds opaque immutable objects keyed by string, used for
//!   snapshot payloads that exceed the inline threshold.
//!
//! Implementations must be `Send + Sync`; the engine shares them behind
//! `Arc<dyn _>`. Backends:
//!
//! - [`MemoryStore`] / [`MemoryBlobStore`]: process-local, for tests and
//!   ephemeral runs.
//! - [`SqliteStore`]: durable single-file deployment (`sqlite` feature).
//! - [`PostgresStore`]: shared multi-executor deployment (`postgres`
//!   feature).

pub mod blob;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;

use crate::events::Event;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Errors surfaced by the relational store contract.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    /// An event with the same `event_id` already exists.
    #[error("duplicate event id: {event_id}")]
    #[diagnostic(
        code(stepledger::store::duplicate_event),
        help("Event ids are UUIDv4; a collision almost always means the same append ran twice.")
    )]
    DuplicateEventId { event_id: String },

    /// The backend cannot guarantee gapless per-workflow sequences.
    #[error("sequence allocation would gap for workflow {workflow_id}")]
    #[diagnostic(code(stepledger::store::sequence_gap))]
    SequenceGap { workflow_id: String },

    /// A fenced write carried a token below the current lease row.
    #[error("stale fencing token {presented} for workflow {workflow_id} (current {current})")]
    #[diagnostic(
        code(stepledger::store::stale_fence),
        help("Another executor has taken over this workflow; abandon the current attempt.")
    )]
    StaleFence {
        workflow_id: String,
        presented: u64,
        current: u64,
    },

    /// A uniqueness constraint rejected the write (expected during attempt
    /// allocation races).
    #[error("conflict on {what}")]
    #[diagnostic(code(stepledger::store::conflict))]
    Conflict { what: String },

    /// Backend failure (connection, transaction, migration).
    #[error("store backend error: {message}")]
    #[diagnostic(code(stepledger::store::backend))]
    Backend { message: String },

    /// A row could not be encoded or decoded.
    #[error("store encoding error: {message}")]
    #[diagnostic(code(stepledger::store::encoding))]
    Encoding { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Fencing token presented with write-side operations.
///
/// The store rejects fenced writes whose token is below the current lease
/// row for the workflow, which is what closes the split-brain window after
/// a takeover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fence {
    pub org_id: String,
    pub owner_id: String,
    pub token: u64,
}

/// One persisted snapshot row. The state bytes live either inline or in the
/// blob store under `blob_key`, never both.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub workflow_id: String,
    pub org_id: String,
    pub step_number: u64,
    pub last_event_seq: i64,
    pub state_inline: Option<Vec<u8>>,
    pub state_blob_key: Option<String>,
    pub state_checksum: String,
    pub created_at: DateTime<Utc>,
}

/// The current lease row for a workflow.
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseRecord {
    pub workflow_id: String,
    pub org_id: String,
    pub owner_id: String,
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

/// One completed-step row; `(workflow_id, step_id)` is unique.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRecord {
    pub workflow_id: String,
    pub step_id: String,
    pub attempt_id: i64,
    pub completed_at: DateTime<Utc>,
    pub result_snapshot_ref: String,
    pub result_checksum: String,
}

/// Relational store contract.
///
/// Requirements on implementations:
///
/// - `append_event` assigns the next per-workflow sequence, computes the
///   event checksum over the assigned sequence, and inserts, all in one
///   atomic unit. Sequence allocation must be serialized per workflow and
///   dense; global sequences are not allowed.
/// - Fenced operations compare the presented token against the current
///   lease row and reject lower tokens with [`StoreError::StaleFence`].
/// - `insert_completion` uses conflict-ignore semantics so concurrent
///   completion marks are harmless.
/// - Lease acquisition allocates fencing tokens from a per-workflow
///   high-water mark that survives lease deletion, keeping tokens strictly
///   increasing across ownership changes and releases.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append `event`, assigning its sequence and checksum. Returns the
    /// assigned sequence.
    async fn append_event(&self, event: &Event, fence: Option<&Fence>) -> Result<i64>;

    /// Events for a workflow with `event_seq > after_seq`, ascending.
    async fn events(&self, workflow_id: &str, after_seq: i64) -> Result<Vec<Event>>;

    /// Insert a snapshot row.
    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

    /// Fetch a snapshot row by id.
    async fn snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>>;

    /// The snapshot row with the highest `last_event_seq`.
    async fn latest_snapshot(&self, workflow_id: &str, org_id: &str)
    -> Result<Option<SnapshotRecord>>;

    /// The snapshot row with the highest `last_event_seq <= max_seq`.
    async fn snapshot_at(
        &self,
        workflow_id: &str,
        org_id: &str,
        max_seq: i64,
    ) -> Result<Option<SnapshotRecord>>;

    /// Acquire the lease when it is free or expired (`lease_expires_at <
    /// now`, strictly). Returns the new row, or `None` when another live
    /// owner holds it.
    async fn try_acquire_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>>;

    /// Extend the lease iff `(owner_id, fencing_token)` still match.
    /// Returns whether a row was updated.
    async fn renew_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        token: u64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the lease row iff the token matches. Returns whether a row
    /// was deleted.
    async fn release_lease(&self, workflow_id: &str, org_id: &str, token: u64) -> Result<bool>;

    /// The current lease row, if any.
    async fn current_lease(&self, workflow_id: &str, org_id: &str)
    -> Result<Option<LeaseRecord>>;

    /// Insert a step attempt row under the given fence. Returns `false`
    /// when `(workflow_id, step_id, attempt_id)` already exists.
    async fn insert_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        attempt_id: i64,
        started_at: DateTime<Utc>,
        fence: &Fence,
    ) -> Result<bool>;

    /// Insert a completion row; conflict-ignore on `(workflow_id, step_id)`.
    async fn insert_completion(&self, record: &CompletionRecord) -> Result<()>;

    /// Fetch the completion row for a step, if any.
    async fn completion(&self, workflow_id: &str, step_id: &str)
    -> Result<Option<CompletionRecord>>;
}
