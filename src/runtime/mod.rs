//! Workflow execution runtime: the driver, execution context, and
//! configuration values.
//!
//! The runtime turns the persistence kernel into a programming model:
//!
//! - [`Engine::run_workflow`](crate::engine::Engine::run_workflow) acquires
//!   the lease, restores or initializes state, and runs the user's workflow
//!   future with an [`ExecutionContext`] installed in a task-local.
//! - [`ExecutionContext::step`] wraps each unit of user work in the
//!   intent/completion event protocol with idempotent replay, retries, and
//!   checkpointing.

pub mod config;
pub mod context;
pub mod driver;

use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::idempotency::IdempotencyError;
use crate::journal::JournalError;
use crate::leases::LeaseError;
use crate::reasoning::HookError;
use crate::recovery::RecoveryError;
use crate::serialization::SerializationError;
use crate::snapshots::SnapshotError;

pub use config::{HealthHook, RetryPolicy, StepConfig, WorkflowOptions};
pub use context::ExecutionContext;

/// Maximum accepted annotation length, in characters.
pub const MAX_ANNOTATION_CHARS: usize = 4096;

/// A failure raised by a user step body.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    /// The step body returned an error.
    #[error("{message}")]
    #[diagnostic(code(stepledger::step::failed))]
    Failed {
        message: String,
        #[source]
        source: Option<HookError>,
    },

    /// The step exceeded its wall-clock deadline.
    #[error("step timed out after {timeout:?}")]
    #[diagnostic(code(stepledger::step::timeout))]
    Timeout { timeout: Duration },
}

impl StepError {
    /// A failure carrying just a message.
    pub fn msg(message: impl Into<String>) -> Self {
        StepError::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an arbitrary error as a step failure.
    pub fn from_error(error: impl Into<HookError>) -> Self {
        let error = error.into();
        StepError::Failed {
            message: error.to_string(),
            source: Some(error),
        }
    }
}

/// Errors surfaced by a workflow invocation.
///
/// Carries the structured kind plus the workflow id where that exists; the
/// user-visible contract is: the invocation returns the body's value on
/// success, re-raises the last step failure when retries exhaust, or raises
/// one of these engine kinds.
#[derive(Debug, Error, Diagnostic)]
pub enum WorkflowError {
    /// Another live executor holds the lease.
    #[error("workflow {workflow_id} is locked by another executor")]
    #[diagnostic(
        code(stepledger::workflow::locked),
        help("Do not retry in-process; the owning executor or a takeover will advance it.")
    )]
    Locked { workflow_id: String },

    /// This executor's lease was fenced off or its heartbeat failed.
    #[error("lease lost for workflow {workflow_id}")]
    #[diagnostic(
        code(stepledger::workflow::lease_lost),
        help("Another executor has taken over; abandon this invocation cleanly.")
    )]
    LeaseLost { workflow_id: String },

    /// A step exhausted its retry policy.
    #[error("step {step_id} failed after {attempts} attempt(s): {source}")]
    #[diagnostic(code(stepledger::workflow::step_failed))]
    StepFailed {
        step_id: String,
        attempts: i64,
        #[source]
        source: StepError,
    },

    /// The invocation exceeded its configured `max_duration`.
    #[error("workflow {workflow_id} exceeded its {max_duration:?} deadline")]
    #[diagnostic(
        code(stepledger::workflow::deadline),
        help("Completed steps are durable; resume the workflow to continue from the last one.")
    )]
    DeadlineExceeded {
        workflow_id: String,
        max_duration: Duration,
    },

    /// Context methods were called outside a running workflow.
    #[error("no active workflow on this task")]
    #[diagnostic(
        code(stepledger::workflow::no_active),
        help("ExecutionContext::current() only resolves inside Engine::run_workflow.")
    )]
    NoActiveWorkflow,

    /// State was requested before the driver installed it.
    #[error("state not initialized for workflow {workflow_id}")]
    #[diagnostic(code(stepledger::workflow::state_uninitialized))]
    StateUninitialized { workflow_id: String },

    /// An annotation exceeded the accepted length.
    #[error("annotation of {len} chars exceeds the {max} char limit")]
    #[diagnostic(code(stepledger::workflow::annotation_too_large))]
    AnnotationTooLarge { len: usize, max: usize },

    /// Failure from the user's workflow body (not a step failure).
    #[error("workflow body failed: {source}")]
    #[diagnostic(code(stepledger::workflow::body))]
    Body {
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    #[diagnostic(code(stepledger::workflow::encoding))]
    Serialization(#[from] SerializationError),
}

impl WorkflowError {
    /// Wrap an arbitrary error as a workflow body failure.
    pub fn body(error: impl Into<HookError>) -> Self {
        WorkflowError::Body {
            source: error.into(),
        }
    }

    /// True when the error means another executor fenced us off.
    pub fn is_lease_loss(&self) -> bool {
        use crate::store::StoreError;
        match self {
            WorkflowError::LeaseLost { .. } => true,
            WorkflowError::Journal(JournalError::Store(StoreError::StaleFence { .. })) => true,
            WorkflowError::Idempotency(IdempotencyError::Store(StoreError::StaleFence {
                ..
            })) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
