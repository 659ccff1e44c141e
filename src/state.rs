//! Workflow state as an immutable, checksummed value object.
//!
//! [`WorkflowState`] is the materialized view of a workflow at a step
//! boundary. It is never mutated in place: every change produces a new
//! value with a freshly computed checksum, so any state the engine hands
//! out can be validated byte-for-byte against its own digest.
//!
//! # Fields
//!
//! - `variables`: the user-visible state, an arbitrary JSON object
//! - `metadata`: engine-maintained data (workflow name, start time, tags)
//! - `step_number`: monotone non-decreasing step counter
//! - `checksum`: SHA-256 over the canonical serialization with the
//!   `checksum` field empty
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use stepledger::state::WorkflowState;
//!
//! let state = WorkflowState::initial("wf-1", "default", "demo", "2026-08-01T00:00:00.000000Z")
//!     .unwrap();
//! assert_eq!(state.step_number, 0);
//! assert!(state.verify_checksum().unwrap());
//!
//! let mut updates = serde_json::Map::new();
//! updates.insert("total".into(), json!(42));
//! let next = state.advanced(updates).unwrap();
//! assert_eq!(next.step_number, 1);
//! assert_eq!(next.variables["total"], json!(42));
//! assert_ne!(next.checksum, state.checksum);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serialization::{self, JsonMap, Result, SerializationError, to_canonical_json};

/// Schema version stamped on newly created states.
pub const STATE_SCHEMA_VERSION: &str = "1.0";

/// Metadata key holding the workflow function name.
pub const META_WORKFLOW_NAME: &str = "workflow_name";
/// Metadata key holding the workflow start timestamp (RFC 3339).
pub const META_STARTED_AT: &str = "started_at";
/// Metadata key holding the user-supplied tag map.
pub const META_TAGS: &str = "tags";

/// Variable key a workflow may populate with savepoint metadata.
pub const SAVEPOINT_METADATA_KEY: &str = "_savepoint_metadata";

/// Immutable snapshot of a workflow's materialized state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub org_id: String,
    pub step_number: u64,
    /// User-visible variables; arbitrary JSON values under string keys.
    pub variables: JsonMap,
    /// Engine-maintained metadata (name, start time, tags).
    pub metadata: JsonMap,
    /// Schema version tag for forward-compatible persistence.
    pub version: String,
    /// SHA-256 hex over the canonical serialization, `checksum` field empty.
    pub checksum: String,
}

impl WorkflowState {
    /// Build the genesis state for a fresh workflow.
    ///
    /// The metadata mirrors what the `workflow.started` event carries, so a
    /// genesis replay from the journal reconstructs a byte-identical value.
    pub fn initial(
        workflow_id: impl Into<String>,
        org_id: impl Into<String>,
        workflow_name: &str,
        started_at: &str,
    ) -> Result<Self> {
        let mut metadata = JsonMap::new();
        metadata.insert(
            META_WORKFLOW_NAME.into(),
            Value::String(workflow_name.into()),
        );
        metadata.insert(META_STARTED_AT.into(), Value::String(started_at.into()));
        metadata.insert(META_TAGS.into(), Value::Object(JsonMap::new()));
        Self {
            workflow_id: workflow_id.into(),
            org_id: org_id.into(),
            step_number: 0,
            variables: JsonMap::new(),
            metadata,
            version: STATE_SCHEMA_VERSION.into(),
            checksum: String::new(),
        }
        .finalized()
    }

    /// Build the genesis state exactly as a `workflow.started` event
    /// describes it.
    ///
    /// The driver uses this on fresh starts and recovery uses it during
    /// genesis replay, so both paths produce byte-identical states.
    pub fn from_started(
        workflow_id: &str,
        org_id: &str,
        workflow_name: &str,
        started_at: &str,
        tags: &rustc_hash::FxHashMap<String, String>,
    ) -> Result<Self> {
        let initial = Self::initial(workflow_id, org_id, workflow_name, started_at)?;
        if tags.is_empty() {
            return Ok(initial);
        }
        let mut tag_map = JsonMap::new();
        for (key, value) in tags {
            tag_map.insert(key.clone(), Value::String(value.clone()));
        }
        initial.with_metadata(META_TAGS, Value::Object(tag_map))
    }

    /// Produce the successor state after a completed step.
    ///
    /// `updates` is merged into `variables` key-by-key, the step counter
    /// advances by one, and the checksum is recomputed.
    pub fn advanced(&self, updates: JsonMap) -> Result<Self> {
        let mut variables = self.variables.clone();
        for (key, value) in updates {
            variables.insert(key, value);
        }
        Self {
            workflow_id: self.workflow_id.clone(),
            org_id: self.org_id.clone(),
            step_number: self.step_number + 1,
            variables,
            metadata: self.metadata.clone(),
            version: self.version.clone(),
            checksum: String::new(),
        }
        .finalized()
    }

    /// Return a copy with one variable set and the checksum recomputed.
    ///
    /// The step counter does not move; this is for out-of-band mutations
    /// between steps (health hooks flagging `should_conclude` and the like).
    pub fn with_variable(&self, key: impl Into<String>, value: Value) -> Result<Self> {
        let mut next = self.clone();
        next.variables.insert(key.into(), value);
        next.checksum = String::new();
        next.finalized()
    }

    /// Return a copy with one metadata entry set and the checksum recomputed.
    pub fn with_metadata(&self, key: impl Into<String>, value: Value) -> Result<Self> {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value);
        next.checksum = String::new();
        next.finalized()
    }

    /// The full state document, checksum included, used for delta
    /// computation and snapshot serialization.
    pub fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|source| SerializationError::Encode { source })
    }

    /// Rebuild a state from its document form without validating the
    /// embedded checksum. Callers that care run
    /// [`verify_checksum`](WorkflowState::verify_checksum).
    pub fn from_document(doc: Value) -> Result<Self> {
        serde_json::from_value(doc).map_err(|source| SerializationError::Encode { source })
    }

    /// Canonical serialized form (what snapshots persist).
    pub fn to_canonical_string(&self) -> Result<String> {
        Ok(to_canonical_json(&self.to_document()?))
    }

    /// Compute the checksum this state *should* carry.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut doc = self.to_document()?;
        doc["checksum"] = Value::String(String::new());
        Ok(serialization::sha256_hex(to_canonical_json(&doc).as_bytes()))
    }

    /// True when the stored checksum matches the recomputed one.
    pub fn verify_checksum(&self) -> Result<bool> {
        Ok(self.checksum == self.compute_checksum()?)
    }

    /// The workflow name recorded at start, if present in metadata.
    pub fn workflow_name(&self) -> Option<&str> {
        self.metadata.get(META_WORKFLOW_NAME).and_then(Value::as_str)
    }

    fn finalized(mut self) -> Result<Self> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }
}
