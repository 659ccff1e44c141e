//! Append-only event journal with per-workflow dense sequencing.
//!
//! The journal is the sole ledger of change: events are never rewritten or
//! deleted, every record is checksummed, and per-workflow sequences are
//! dense (`1..=N`). Correctness of the whole engine rests here; snapshots
//! and cached step results are merely accelerants.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::events::Event;
use crate::leases::Lease;
use crate::store::{Store, StoreError};

/// Errors from journal operations.
#[derive(Debug, Error, Diagnostic)]
pub enum JournalError {
    /// A stored event's checksum no longer matches its content.
    #[error("event {event_id} (seq {event_seq}) failed checksum validation")]
    #[diagnostic(
        code(stepledger::journal::event_corruption),
        help("The journal row was altered after append; refuse to build state from this history.")
    )]
    EventCorruption { event_id: String, event_seq: i64 },

    /// An event could not be checksummed or decoded.
    #[error(transparent)]
    #[diagnostic(code(stepledger::journal::encoding))]
    Serialization(#[from] crate::serialization::SerializationError),

    /// Underlying store failure (including stale-fence rejections).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Handle over the journal rows of the relational store.
#[derive(Clone)]
pub struct EventJournal {
    store: Arc<dyn Store>,
}

impl EventJournal {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append an event under an optional lease fence.
    ///
    /// The store assigns the next sequence for `event.workflow_id`
    /// atomically with the insert and computes the checksum over the
    /// assigned sequence. Returns the sequence.
    #[instrument(skip(self, event), fields(workflow_id = %event.workflow_id, kind = %event.kind()), err)]
    pub async fn append(&self, event: Event, fence: Option<&Lease>) -> Result<i64> {
        let fence = fence.map(Lease::fence);
        let seq = self.store.append_event(&event, fence.as_ref()).await?;
        tracing::debug!(seq, "event appended");
        Ok(seq)
    }

    /// Events with `event_seq > after_seq`, ascending.
    ///
    /// With `validate` set, each record's checksum is recomputed; a
    /// mismatch is [`JournalError::EventCorruption`]. Reads that opt out
    /// exist only for bulk context extraction where integrity is checked
    /// elsewhere.
    #[instrument(skip(self), err)]
    pub async fn events(
        &self,
        workflow_id: &str,
        after_seq: i64,
        validate: bool,
    ) -> Result<Vec<Event>> {
        let events = self.store.events(workflow_id, after_seq).await?;
        if validate {
            for event in &events {
                if !event.verify_checksum()? {
                    return Err(JournalError::EventCorruption {
                        event_id: event.event_id.clone(),
                        event_seq: event.event_seq,
                    });
                }
            }
        }
        Ok(events)
    }
}
