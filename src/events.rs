//! Journal events: the authoritative history of a workflow.
//!
//! An [`Event`] is an immutable record appended to the per-workflow journal.
//! The record fields (ids, sequence, timestamps, versions) frame a typed
//! [`EventPayload`]; the payload serializes as a JSON object carrying its
//! own fields plus the `event_type` discriminator and `schema_version`.
//!
//! Each event carries a SHA-256 checksum over the canonical JSON of the
//! stored payload merged with the record fields `(event_id, workflow_id,
//! event_seq, timestamp, producer_version)`. The sequence is part of the
//! digest, so checksums are assigned together with sequences at append time.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use json_patch::Patch;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::serialization::{self, JsonMap, Result, SerializationError, to_canonical_json};

/// Schema version stamped on newly produced events.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// Producer version recorded on append (this crate's version).
pub const PRODUCER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current UTC time truncated to microseconds.
///
/// Timestamps participate in checksums via their RFC 3339 rendering, which
/// carries microsecond precision; truncating up front keeps the in-memory
/// value and its persisted form in lockstep.
pub fn utc_now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Render a timestamp the way the journal stores it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Discriminator for the payload kinds the journal understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkflowStarted,
    StepIntention,
    StepCompleted,
    StepFailed,
    SavepointCreated,
    WorkflowSuspended,
    WorkflowRestored,
    WorkflowCompleted,
    Annotation,
    ReasoningIngested,
    ContextDigest,
}

impl EventKind {
    /// Wire name, identical to the serde tag on [`EventPayload`].
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::StepIntention => "step.intention",
            EventKind::StepCompleted => "step.completed",
            EventKind::StepFailed => "step.failed",
            EventKind::SavepointCreated => "savepoint.created",
            EventKind::WorkflowSuspended => "workflow.suspended",
            EventKind::WorkflowRestored => "workflow.restored",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::Annotation => "context.annotation",
            EventKind::ReasoningIngested => "context.reasoning",
            EventKind::ContextDigest => "context.digest",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Epistemic metadata attached to a savepoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SavepointMetadata {
    #[serde(default)]
    pub goal_summary: String,
    #[serde(default)]
    pub hypotheses: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Value>,
    #[serde(default)]
    pub next_step: String,
}

/// One savepoint recovered from the journal, with its journal position.
#[derive(Clone, Debug, PartialEq)]
pub struct Savepoint {
    pub savepoint_id: String,
    pub step_number: u64,
    pub event_seq: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: SavepointMetadata,
    pub snapshot_ref: String,
}

/// Typed event payloads.
///
/// The serde tag doubles as the `event_type` column, so a payload document
/// always carries its discriminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    #[serde(rename = "workflow.started")]
    WorkflowStarted {
        workflow_name: String,
        #[serde(default)]
        tags: FxHashMap<String, String>,
        started_at: String,
    },

    #[serde(rename = "step.intention")]
    StepIntention {
        step_id: String,
        step_name: String,
        attempt_id: i64,
    },

    #[serde(rename = "step.completed")]
    StepCompleted {
        step_id: String,
        attempt_id: i64,
        state_delta: Patch,
        duration_ms: u64,
    },

    #[serde(rename = "step.failed")]
    StepFailed {
        step_id: String,
        attempt_id: i64,
        error: String,
    },

    #[serde(rename = "savepoint.created")]
    SavepointCreated {
        savepoint_id: String,
        step_number: u64,
        goal_summary: String,
        current_hypotheses: Vec<String>,
        open_questions: Vec<String>,
        decision_log: Vec<Value>,
        next_step: String,
        snapshot_ref: String,
    },

    #[serde(rename = "workflow.suspended")]
    WorkflowSuspended { reason: String },

    #[serde(rename = "workflow.restored")]
    WorkflowRestored {
        step_number: u64,
        last_event_seq: i64,
    },

    #[serde(rename = "workflow.completed")]
    WorkflowCompleted {},

    #[serde(rename = "context.annotation")]
    Annotation {
        step_number: u64,
        step_name: String,
        text: String,
    },

    #[serde(rename = "context.reasoning")]
    ReasoningIngested {
        step_number: u64,
        chunk: String,
        chunk_size: u64,
    },

    #[serde(rename = "context.digest")]
    ContextDigest {
        step_number: u64,
        digest: Value,
        chunks_processed: u64,
        distill_failed: bool,
        #[serde(default)]
        error: String,
        #[serde(default)]
        raw_chunks: Vec<String>,
    },
}

impl EventPayload {
    /// The kind discriminator for this payload.
    pub const fn kind(&self) -> EventKind {
        match self {
            EventPayload::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            EventPayload::StepIntention { .. } => EventKind::StepIntention,
            EventPayload::StepCompleted { .. } => EventKind::StepCompleted,
            EventPayload::StepFailed { .. } => EventKind::StepFailed,
            EventPayload::SavepointCreated { .. } => EventKind::SavepointCreated,
            EventPayload::WorkflowSuspended { .. } => EventKind::WorkflowSuspended,
            EventPayload::WorkflowRestored { .. } => EventKind::WorkflowRestored,
            EventPayload::WorkflowCompleted {} => EventKind::WorkflowCompleted,
            EventPayload::Annotation { .. } => EventKind::Annotation,
            EventPayload::ReasoningIngested { .. } => EventKind::ReasoningIngested,
            EventPayload::ContextDigest { .. } => EventKind::ContextDigest,
        }
    }
}

/// One immutable journal record.
///
/// `event_seq` is `0` until the store assigns the real sequence during
/// append; `checksum` is filled at the same moment because the sequence is
/// part of the digest input.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub workflow_id: String,
    pub org_id: String,
    pub event_seq: i64,
    pub timestamp: DateTime<Utc>,
    pub schema_version: String,
    pub producer_version: String,
    pub payload: EventPayload,
    pub checksum: String,
}

impl Event {
    /// Create an unsequenced event ready for append.
    pub fn new(
        workflow_id: impl Into<String>,
        org_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            org_id: org_id.into(),
            event_seq: 0,
            timestamp: utc_now_micros(),
            schema_version: EVENT_SCHEMA_VERSION.into(),
            producer_version: PRODUCER_VERSION.into(),
            payload,
            checksum: String::new(),
        }
    }

    /// The payload kind.
    pub const fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The stored payload document: payload fields plus `event_type` (via
    /// the serde tag) and `schema_version`.
    pub fn payload_document(&self) -> Result<JsonMap> {
        let value = serde_json::to_value(&self.payload)
            .map_err(|source| SerializationError::Encode { source })?;
        let Value::Object(mut doc) = value else {
            unreachable!("tagged enum serializes to an object");
        };
        doc.insert(
            "schema_version".into(),
            Value::String(self.schema_version.clone()),
        );
        Ok(doc)
    }

    /// Canonical JSON of the stored payload column.
    pub fn payload_json(&self) -> Result<String> {
        Ok(to_canonical_json(&Value::Object(self.payload_document()?)))
    }

    /// Rebuild a payload from its stored document form.
    pub fn payload_from_document(mut doc: JsonMap) -> Result<EventPayload> {
        // schema_version frames the payload in storage but is a record
        // field, not a payload field.
        doc.remove("schema_version");
        serde_json::from_value(Value::Object(doc))
            .map_err(|source| SerializationError::Encode { source })
    }

    /// Compute the checksum for this event at sequence `event_seq`.
    ///
    /// Digest input: the stored payload object merged with the framing
    /// record fields, checksum absent, canonically encoded.
    pub fn compute_checksum_at(&self, event_seq: i64) -> Result<String> {
        let mut doc = self.payload_document()?;
        doc.insert("event_id".into(), Value::String(self.event_id.clone()));
        doc.insert(
            "workflow_id".into(),
            Value::String(self.workflow_id.clone()),
        );
        doc.insert("event_seq".into(), Value::from(event_seq));
        doc.insert(
            "timestamp".into(),
            Value::String(format_timestamp(&self.timestamp)),
        );
        doc.insert(
            "producer_version".into(),
            Value::String(self.producer_version.clone()),
        );
        Ok(serialization::sha256_hex(
            to_canonical_json(&Value::Object(doc)).as_bytes(),
        ))
    }

    /// Checksum at the event's already-assigned sequence.
    pub fn compute_checksum(&self) -> Result<String> {
        self.compute_checksum_at(self.event_seq)
    }

    /// True when the stored checksum matches the recomputed one.
    pub fn verify_checksum(&self) -> Result<bool> {
        Ok(self.checksum == self.compute_checksum()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intention() -> Event {
        Event::new(
            "wf-1",
            "default",
            EventPayload::StepIntention {
                step_id: "fetch_0".into(),
                step_name: "fetch".into(),
                attempt_id: 1,
            },
        )
    }

    #[test]
    fn payload_document_carries_tag_and_schema() {
        let event = intention();
        let doc = event.payload_document().unwrap();
        assert_eq!(doc["event_type"], json!("step.intention"));
        assert_eq!(doc["schema_version"], json!("1.0"));
        assert_eq!(doc["step_id"], json!("fetch_0"));
    }

    #[test]
    fn payload_round_trips_through_document() {
        let event = intention();
        let doc = event.payload_document().unwrap();
        let back = Event::payload_from_document(doc).unwrap();
        assert_eq!(back, event.payload);
    }

    #[test]
    fn checksum_depends_on_sequence() {
        let event = intention();
        let at_one = event.compute_checksum_at(1).unwrap();
        let at_two = event.compute_checksum_at(2).unwrap();
        assert_ne!(at_one, at_two);
    }

    #[test]
    fn sequenced_event_verifies() {
        let mut event = intention();
        event.event_seq = 7;
        event.checksum = event.compute_checksum().unwrap();
        assert!(event.verify_checksum().unwrap());

        event.checksum = "deadbeef".repeat(8);
        assert!(!event.verify_checksum().unwrap());
    }

    #[test]
    fn kind_names_match_wire_format() {
        assert_eq!(EventKind::WorkflowStarted.as_str(), "workflow.started");
        assert_eq!(EventKind::ContextDigest.as_str(), "context.digest");
        let event = intention();
        assert_eq!(event.kind().as_str(), "step.intention");
    }

    #[test]
    fn timestamps_survive_format_parse_round_trip() {
        let now = utc_now_micros();
        let rendered = format_timestamp(&now);
        let parsed: DateTime<Utc> = rendered.parse().unwrap();
        assert_eq!(parsed, now);
    }
}
