//! # Stepledger: Durable Step-Workflow Execution
//!
//! Stepledger is a durable execution engine for long-running, step-oriented
//! workflows (agent and LLM pipelines being the typical shape). A workflow
//! is ordinary async code that invokes side-effectful **steps**; the engine
//! journals enough to resume bit-exact after a crash, replays cached
//! completions instead of re-executing them, and guarantees that only one
//! executor at a time can durably advance a given workflow.
//!
//! ## Guarantees
//!
//! - **Exactly-once steps**: each step completes at most once, enforced by
//!   a unique completion row and cached-result replay.
//! - **Deterministic recovery**: state rebuilds from the newest usable
//!   snapshot plus a replay of checksummed journal deltas.
//! - **Single-writer ownership**: leases with monotonically increasing
//!   fencing tokens; stale executors are rejected at the store.
//!
//! ## Quick Start
//!
//! ```
//! use serde_json::json;
//! use stepledger::engine::Engine;
//! use stepledger::runtime::WorkflowOptions;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), stepledger::runtime::WorkflowError> {
//! let engine = Engine::in_memory();
//!
//! let total = engine
//!     .run_workflow(WorkflowOptions::new("checkout"), |ctx| async move {
//!         let vars = ctx
//!             .step("reserve_stock", |_vars| async move {
//!                 let mut updates = serde_json::Map::new();
//!                 updates.insert("reserved".into(), json!(3));
//!                 Ok(updates)
//!             })
//!             .await?;
//!         Ok(vars["reserved"].as_i64().unwrap_or(0))
//!     })
//!     .await?;
//!
//! assert_eq!(total, 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`serialization`] - Canonical JSON, SHA-256 checksums, RFC 6902 deltas
//! - [`state`] - The immutable, checksummed workflow state value
//! - [`events`] - Journal records and typed payloads
//! - [`journal`] - Append-only, per-workflow sequenced event log
//! - [`snapshots`] - Inline/blob hybrid snapshot store
//! - [`leases`] - Fencing-tokened single-writer ownership
//! - [`idempotency`] - Attempt allocation and at-most-one completion
//! - [`recovery`] - Snapshot + replay restore, point-in-time restore
//! - [`reasoning`] - Reasoning buffers, health signals, digests
//! - [`engine`] - Explicit engine value wiring the kernel together
//! - [`runtime`] - The execution driver, context, and configuration
//! - [`store`] - Relational and blob store contracts and backends
//! - [`telemetry`] - Pluggable execution metrics
//! - [`recipes`] - Ready-made health-check hooks

pub mod engine;
pub mod events;
pub mod idempotency;
pub mod journal;
pub mod leases;
pub mod reasoning;
pub mod recipes;
pub mod recovery;
pub mod runtime;
pub mod serialization;
pub mod snapshots;
pub mod state;
pub mod store;
pub mod telemetry;
