//! Single-writer workflow ownership via fencing-tokened leases.
//!
//! At most one executor advances a workflow at a time. Ownership is a
//! time-bounded lease row keyed by `(workflow_id, org_id)`; every acquire
//! (fresh or takeover) allocates a fencing token from a per-workflow
//! high-water mark, so tokens are strictly increasing across ownership
//! changes and releases. Write-side operations carry the token and the
//! store rejects anything below the current one. A takeover invalidates
//! all in-flight writes from the previous owner with no split-brain window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::events::utc_now_micros;
use crate::store::{Fence, LeaseRecord, Store, StoreError};

/// Default lease duration.
pub const LEASE_DURATION: Duration = Duration::from_secs(300);

/// Default heartbeat cadence (lease duration / 10).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Errors from lease operations.
#[derive(Debug, Error, Diagnostic)]
pub enum LeaseError {
    /// The configured lease duration does not fit a chrono delta.
    #[error("invalid lease duration: {0:?}")]
    #[diagnostic(code(stepledger::leases::duration))]
    InvalidDuration(Duration),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, LeaseError>;

/// A held lease: proof of single-writer ownership until `expires_at`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub workflow_id: String,
    pub org_id: String,
    pub owner_id: String,
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// The fence presented with write-side store operations.
    pub fn fence(&self) -> Fence {
        Fence {
            org_id: self.org_id.clone(),
            owner_id: self.owner_id.clone(),
            token: self.fencing_token,
        }
    }

    fn from_record(record: LeaseRecord) -> Self {
        Self {
            workflow_id: record.workflow_id,
            org_id: record.org_id,
            owner_id: record.owner_id,
            fencing_token: record.fencing_token,
            acquired_at: record.acquired_at,
            expires_at: record.lease_expires_at,
        }
    }
}

/// Acquire, renew, and release workflow leases.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_duration(store, LEASE_DURATION)
    }

    pub fn with_duration(store: Arc<dyn Store>, duration: Duration) -> Self {
        Self { store, duration }
    }

    /// The configured lease duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The heartbeat cadence: a tenth of the lease duration.
    pub fn heartbeat_interval(&self) -> Duration {
        self.duration / 10
    }

    fn delta(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.duration).map_err(|_| LeaseError::InvalidDuration(self.duration))
    }

    /// Acquire the lease for a workflow.
    ///
    /// Succeeds when no lease row exists or the existing row has expired
    /// (strictly before now; a lease is still held at the instant of its
    /// own expiry). Returns `None` while another live owner holds it; that
    /// is contention, not an error.
    #[instrument(skip(self), err)]
    pub async fn acquire(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
    ) -> Result<Option<Lease>> {
        let now = utc_now_micros();
        let expires_at = now + self.delta()?;
        let acquired = self
            .store
            .try_acquire_lease(workflow_id, org_id, owner_id, now, expires_at)
            .await?;
        match acquired {
            Some(record) => {
                tracing::debug!(token = record.fencing_token, "lease acquired");
                Ok(Some(Lease::from_record(record)))
            }
            None => {
                tracing::debug!("lease held by another owner");
                Ok(None)
            }
        }
    }

    /// Extend the lease if `(owner_id, fencing_token)` still match.
    ///
    /// A mismatch is a silent no-op (`false`); the caller discovers the
    /// loss on its next fenced write.
    #[instrument(skip(self, lease), fields(workflow_id = %lease.workflow_id), err)]
    pub async fn heartbeat(&self, lease: &Lease) -> Result<bool> {
        let now = utc_now_micros();
        let expires_at = now + self.delta()?;
        let renewed = self
            .store
            .renew_lease(
                &lease.workflow_id,
                &lease.org_id,
                &lease.owner_id,
                lease.fencing_token,
                now,
                expires_at,
            )
            .await?;
        if !renewed {
            tracing::warn!(token = lease.fencing_token, "heartbeat no-op: lease row moved on");
        }
        Ok(renewed)
    }

    /// Delete the lease row if the token matches.
    #[instrument(skip(self, lease), fields(workflow_id = %lease.workflow_id), err)]
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        let released = self
            .store
            .release_lease(&lease.workflow_id, &lease.org_id, lease.fencing_token)
            .await?;
        tracing::debug!(token = lease.fencing_token, released, "lease release");
        Ok(released)
    }
}
