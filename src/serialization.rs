//! Canonical serialization, checksums, and state deltas.
//!
//! Everything the engine persists is checksummed over a *canonical* JSON
//! form: UTF-8, lexicographically sorted object keys, no insignificant
//! whitespace, arrays in source order. Two encodings of the same value are
//! therefore byte-identical, which is what makes checksum validation and
//! replay determinism meaningful.
//!
//! State changes travel as RFC 6902 JSON-Patch documents produced by
//! [`compute_delta`] and re-applied by [`apply_delta`].
//!
//! # Examples
//!
//! ```
//! use serde_json::json;
//! use stepledger::serialization::{apply_delta, compute_delta, to_canonical_json};
//!
//! assert_eq!(to_canonical_json(&json!({"b": 2, "a": 1})), r#"{"a":1,"b":2}"#);
//!
//! let old = json!({"count": 1});
//! let new = json!({"count": 2, "done": true});
//! let delta = compute_delta(&old, &new);
//! assert_eq!(apply_delta(old, &delta).unwrap(), new);
//! ```

use json_patch::Patch;
use miette::Diagnostic;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Alias for the JSON object map used throughout the engine.
///
/// `serde_json`'s default map is backed by a `BTreeMap`, so object keys are
/// already lexicographically sorted; canonical encoding relies on that.
pub type JsonMap = serde_json::Map<String, Value>;

/// Errors raised by canonical encoding and delta application.
#[derive(Debug, Error, Diagnostic)]
pub enum SerializationError {
    /// A value could not be converted to or from its JSON document form.
    #[error("JSON encoding failed: {source}")]
    #[diagnostic(
        code(stepledger::serialization::encode),
        help("The value contains something serde_json cannot represent (e.g. a non-finite float).")
    )]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    /// A JSON-Patch operation failed its path or `test` precondition.
    #[error("invalid state delta: {source}")]
    #[diagnostic(
        code(stepledger::serialization::invalid_patch),
        help("The delta was computed against a different base document; histories have diverged.")
    )]
    InvalidPatch {
        #[source]
        source: json_patch::PatchError,
    },
}

pub type Result<T> = std::result::Result<T, SerializationError>;

/// Render a JSON value in canonical form.
///
/// Object keys come out sorted because [`JsonMap`] is BTreeMap-backed, and
/// `serde_json::to_string` emits no insignificant whitespace. Values that
/// arrive through `serde_json::to_value` are always representable, so this
/// never fails.
pub fn to_canonical_json(value: &Value) -> String {
    serde_json::to_string(value).expect("serde_json::Value is always serializable")
}

/// Serialize any value to canonical JSON bytes.
///
/// The value is first lifted to a [`Value`] so that map keys are sorted
/// regardless of struct field declaration order.
pub fn canonical_bytes<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let doc = serde_json::to_value(value).map_err(|source| SerializationError::Encode { source })?;
    Ok(to_canonical_json(&doc).into_bytes())
}

/// SHA-256 of `bytes`, as a lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Checksum a serializable value over its canonical encoding.
pub fn checksum_of<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Compute the RFC 6902 patch transforming `old` into `new`.
///
/// The patch is minimal in the sense of `json_patch::diff`: unchanged
/// subtrees produce no operations, so replaying a journal of deltas touches
/// exactly what each step changed.
pub fn compute_delta(old: &Value, new: &Value) -> Patch {
    json_patch::diff(old, new)
}

/// Apply an RFC 6902 patch to `doc`, returning the patched document.
///
/// Any path or `test` precondition failure means the patch was computed
/// against a different base than `doc` (histories have diverged) and is
/// reported as [`SerializationError::InvalidPatch`].
pub fn apply_delta(mut doc: Value, delta: &Patch) -> Result<Value> {
    json_patch::patch(&mut doc, delta)
        .map_err(|source| SerializationError::InvalidPatch { source })?;
    Ok(doc)
}
