//! In-memory store backend.
//!
//! Volatile, process-local implementation of [`Store`]. Fast and
//! dependency-free; suitable for tests, examples, and ephemeral runs. The
//! semantics match the durable backends exactly (dense per-workflow
//! sequences, fencing checks, conflict-ignore completions), so engine
//! tests exercised against `MemoryStore` carry over.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::events::Event;

use super::{CompletionRecord, Fence, LeaseRecord, Result, SnapshotRecord, Store, StoreError};

#[derive(Default)]
struct Tables {
    /// Per-workflow journals, kept in append (= sequence) order.
    events: FxHashMap<String, Vec<Event>>,
    event_ids: FxHashSet<String>,
    seq_counters: FxHashMap<String, i64>,
    snapshots: FxHashMap<String, SnapshotRecord>,
    leases: FxHashMap<(String, String), LeaseRecord>,
    /// Fencing high-water marks; survive lease deletion.
    fence_marks: FxHashMap<(String, String), u64>,
    attempts: FxHashSet<(String, String, i64)>,
    completions: FxHashMap<(String, String), CompletionRecord>,
}

impl Tables {
    fn check_fence(&self, workflow_id: &str, fence: &Fence) -> Result<()> {
        let key = (workflow_id.to_string(), fence.org_id.clone());
        let current = match self.leases.get(&key) {
            Some(row) => row.fencing_token,
            None => self.fence_marks.get(&key).copied().unwrap_or(0),
        };
        if fence.token < current {
            return Err(StoreError::StaleFence {
                workflow_id: workflow_id.to_string(),
                presented: fence.token,
                current,
            });
        }
        Ok(())
    }
}

/// Process-local [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_event(&self, event: &Event, fence: Option<&Fence>) -> Result<i64> {
        let mut tables = self.inner.write();
        if let Some(fence) = fence {
            tables.check_fence(&event.workflow_id, fence)?;
        }
        if tables.event_ids.contains(&event.event_id) {
            return Err(StoreError::DuplicateEventId {
                event_id: event.event_id.clone(),
            });
        }
        let seq = {
            let counter = tables
                .seq_counters
                .entry(event.workflow_id.clone())
                .or_insert(0);
            *counter += 1;
            *counter
        };
        let mut stored = event.clone();
        stored.event_seq = seq;
        stored.checksum = stored
            .compute_checksum()
            .map_err(|e| StoreError::Encoding {
                message: e.to_string(),
            })?;
        tables.event_ids.insert(stored.event_id.clone());
        tables
            .events
            .entry(event.workflow_id.clone())
            .or_default()
            .push(stored);
        Ok(seq)
    }

    async fn events(&self, workflow_id: &str, after_seq: i64) -> Result<Vec<Event>> {
        let tables = self.inner.read();
        Ok(tables
            .events
            .get(workflow_id)
            .map(|journal| {
                journal
                    .iter()
                    .filter(|e| e.event_seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let mut tables = self.inner.write();
        tables
            .snapshots
            .insert(record.snapshot_id.clone(), record.clone());
        Ok(())
    }

    async fn snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        Ok(self.inner.read().snapshots.get(snapshot_id).cloned())
    }

    async fn latest_snapshot(
        &self,
        workflow_id: &str,
        org_id: &str,
    ) -> Result<Option<SnapshotRecord>> {
        let tables = self.inner.read();
        Ok(tables
            .snapshots
            .values()
            .filter(|s| s.workflow_id == workflow_id && s.org_id == org_id)
            .max_by_key(|s| s.last_event_seq)
            .cloned())
    }

    async fn snapshot_at(
        &self,
        workflow_id: &str,
        org_id: &str,
        max_seq: i64,
    ) -> Result<Option<SnapshotRecord>> {
        let tables = self.inner.read();
        Ok(tables
            .snapshots
            .values()
            .filter(|s| {
                s.workflow_id == workflow_id && s.org_id == org_id && s.last_event_seq <= max_seq
            })
            .max_by_key(|s| s.last_event_seq)
            .cloned())
    }

    async fn try_acquire_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>> {
        let mut tables = self.inner.write();
        let key = (workflow_id.to_string(), org_id.to_string());
        if let Some(existing) = tables.leases.get(&key) {
            // Takeover only past expiry; equality is still "held".
            if existing.lease_expires_at >= now {
                return Ok(None);
            }
        }
        let token = {
            let mark = tables.fence_marks.entry(key.clone()).or_insert(0);
            *mark += 1;
            *mark
        };
        let record = LeaseRecord {
            workflow_id: workflow_id.to_string(),
            org_id: org_id.to_string(),
            owner_id: owner_id.to_string(),
            fencing_token: token,
            acquired_at: now,
            lease_expires_at: expires_at,
            heartbeat_at: now,
        };
        tables.leases.insert(key, record.clone());
        Ok(Some(record))
    }

    async fn renew_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        token: u64,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.inner.write();
        let key = (workflow_id.to_string(), org_id.to_string());
        match tables.leases.get_mut(&key) {
            Some(row) if row.owner_id == owner_id && row.fencing_token == token => {
                row.heartbeat_at = now;
                row.lease_expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, workflow_id: &str, org_id: &str, token: u64) -> Result<bool> {
        let mut tables = self.inner.write();
        let key = (workflow_id.to_string(), org_id.to_string());
        match tables.leases.get(&key) {
            Some(row) if row.fencing_token == token => {
                tables.leases.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
    ) -> Result<Option<LeaseRecord>> {
        let tables = self.inner.read();
        Ok(tables
            .leases
            .get(&(workflow_id.to_string(), org_id.to_string()))
            .cloned())
    }

    async fn insert_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        attempt_id: i64,
        started_at: DateTime<Utc>,
        fence: &Fence,
    ) -> Result<bool> {
        let _ = started_at;
        let mut tables = self.inner.write();
        tables.check_fence(workflow_id, fence)?;
        let key = (workflow_id.to_string(), step_id.to_string(), attempt_id);
        if tables.attempts.contains(&key) {
            return Ok(false);
        }
        tables.attempts.insert(key);
        Ok(true)
    }

    async fn insert_completion(&self, record: &CompletionRecord) -> Result<()> {
        let mut tables = self.inner.write();
        let key = (record.workflow_id.clone(), record.step_id.clone());
        // ON CONFLICT DO NOTHING: first completion wins.
        tables.completions.entry(key).or_insert_with(|| record.clone());
        Ok(())
    }

    async fn completion(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletionRecord>> {
        let tables = self.inner.read();
        Ok(tables
            .completions
            .get(&(workflow_id.to_string(), step_id.to_string()))
            .cloned())
    }
}
