/*!
SQLite store backend

Durable single-file implementation of the [`Store`] contract, suitable for
single-host deployments and integration tests. Pairs naturally with
[`FsBlobStore`](super::FsBlobStore) for oversized snapshots.

## Behavior

- Per-workflow sequences are allocated from an `event_counters` row with an
  upserting `RETURNING` statement inside the append transaction, so the
  sequence, the checksum computed over it, and the insert commit or roll
  back as one unit.
- Fenced writes compare the presented token against the current
  `workflow_leases` row (falling back to the `fencing_counters` high-water
  mark when the lease row is gone) inside the same transaction.
- When the `sqlite-migrations` feature is enabled (default), embedded
  migrations (`sqlx::migrate!("./migrations")`) run on connect; disabling
  the feature assumes external migration orchestration.

## Timestamps

Stored as RFC 3339 text with microsecond precision. The fixed-width format
makes lexicographic comparison chronological, which the expiry checks use.
*/

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use crate::events::{Event, format_timestamp};
use crate::serialization::JsonMap;

use super::{
    CompletionRecord, Fence, LeaseRecord, Result, SnapshotRecord, Store, StoreError,
};

/// SQLite-backed [`Store`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

fn backend(context: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        message: format!("{context}: {error}"),
    }
}

fn parse_timestamp(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Encoding {
            message: format!("{column}: {e}"),
        })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl SqliteStore {
    /// Connect (or create) a SQLite database at `database_url`.
    /// Example URL: `sqlite://stepledger.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Ensure the underlying file exists; SqlitePool does not create it.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| backend("connect", e))?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| backend("migrate", e))?;
        }
        Ok(Self { pool })
    }

    /// Resolve a database URL from the environment (`STEPLEDGER_SQLITE_URL`,
    /// then `SQLITE_DB_NAME`, then `stepledger.db`) and connect.
    pub async fn connect_from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let url = std::env::var("STEPLEDGER_SQLITE_URL").unwrap_or_else(|_| {
            let name =
                std::env::var("SQLITE_DB_NAME").unwrap_or_else(|_| "stepledger.db".to_string());
            format!("sqlite://{name}")
        });
        Self::connect(&url).await
    }

    fn row_to_event(row: &SqliteRow) -> Result<Event> {
        let payload_json: String = row.get("payload");
        let doc: JsonMap =
            serde_json::from_str(&payload_json).map_err(|e| StoreError::Encoding {
                message: format!("payload: {e}"),
            })?;
        let payload = Event::payload_from_document(doc).map_err(|e| StoreError::Encoding {
            message: format!("payload: {e}"),
        })?;
        let timestamp: String = row.get("timestamp");
        Ok(Event {
            event_id: row.get("event_id"),
            workflow_id: row.get("workflow_id"),
            org_id: row.get("org_id"),
            event_seq: row.get("event_seq"),
            timestamp: parse_timestamp(&timestamp, "timestamp")?,
            schema_version: row.get("schema_version"),
            producer_version: row.get("producer_version"),
            payload,
            checksum: row.get("checksum"),
        })
    }

    fn row_to_snapshot(row: &SqliteRow) -> Result<SnapshotRecord> {
        let created_at: String = row.get("created_at");
        Ok(SnapshotRecord {
            snapshot_id: row.get("snapshot_id"),
            workflow_id: row.get("workflow_id"),
            org_id: row.get("org_id"),
            step_number: row.get::<i64, _>("step_number") as u64,
            last_event_seq: row.get("last_event_seq"),
            state_inline: row.get("state_inline"),
            state_blob_key: row.get("state_blob_key"),
            state_checksum: row.get("state_checksum"),
            created_at: parse_timestamp(&created_at, "created_at")?,
        })
    }

    fn row_to_lease(row: &SqliteRow) -> Result<LeaseRecord> {
        let acquired_at: String = row.get("acquired_at");
        let expires_at: String = row.get("lease_expires_at");
        let heartbeat_at: String = row.get("heartbeat_at");
        Ok(LeaseRecord {
            workflow_id: row.get("workflow_id"),
            org_id: row.get("org_id"),
            owner_id: row.get("owner_id"),
            fencing_token: row.get::<i64, _>("fencing_token") as u64,
            acquired_at: parse_timestamp(&acquired_at, "acquired_at")?,
            lease_expires_at: parse_timestamp(&expires_at, "lease_expires_at")?,
            heartbeat_at: parse_timestamp(&heartbeat_at, "heartbeat_at")?,
        })
    }
}

/// Fence check against the lease row, or the high-water mark when the row
/// is gone. Runs inside the caller's transaction.
async fn check_fence(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    workflow_id: &str,
    fence: &Fence,
) -> Result<()> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT fencing_token FROM workflow_leases WHERE workflow_id = ?1 AND org_id = ?2",
    )
    .bind(workflow_id)
    .bind(&fence.org_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| backend("fence check", e))?;
    let current = match current {
        Some(token) => token,
        None => sqlx::query_scalar(
            "SELECT last_token FROM fencing_counters WHERE workflow_id = ?1 AND org_id = ?2",
        )
        .bind(workflow_id)
        .bind(&fence.org_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| backend("fence check", e))?
        .unwrap_or(0),
    };
    if (fence.token as i64) < current {
        return Err(StoreError::StaleFence {
            workflow_id: workflow_id.to_string(),
            presented: fence.token,
            current: current as u64,
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, event), fields(workflow_id = %event.workflow_id), err)]
    async fn append_event(&self, event: &Event, fence: Option<&Fence>) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("tx begin", e))?;

        if let Some(fence) = fence {
            check_fence(&mut tx, &event.workflow_id, fence).await?;
        }

        // Allocate the next dense sequence for this workflow. The counter
        // row serializes concurrent appends per workflow.
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_counters (workflow_id, next_seq)
            VALUES (?1, 1)
            ON CONFLICT (workflow_id) DO UPDATE SET next_seq = next_seq + 1
            RETURNING next_seq
            "#,
        )
        .bind(&event.workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| backend("sequence allocation", e))?;

        let checksum = event
            .compute_checksum_at(seq)
            .map_err(|e| StoreError::Encoding {
                message: e.to_string(),
            })?;
        let payload_json = event.payload_json().map_err(|e| StoreError::Encoding {
            message: e.to_string(),
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, workflow_id, org_id, event_seq, event_type,
                payload, timestamp, schema_version, producer_version, checksum
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.workflow_id)
        .bind(&event.org_id)
        .bind(seq)
        .bind(event.kind().as_str())
        .bind(&payload_json)
        .bind(format_timestamp(&event.timestamp))
        .bind(&event.schema_version)
        .bind(&event.producer_version)
        .bind(&checksum)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::DuplicateEventId {
                    event_id: event.event_id.clone(),
                });
            }
            Err(error) => return Err(backend("insert event", error)),
        }

        tx.commit().await.map_err(|e| backend("tx commit", e))?;
        Ok(seq)
    }

    async fn events(&self, workflow_id: &str, after_seq: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, workflow_id, org_id, event_seq, payload,
                   timestamp, schema_version, producer_version, checksum
            FROM events
            WHERE workflow_id = ?1 AND event_seq > ?2
            ORDER BY event_seq ASC
            "#,
        )
        .bind(workflow_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("select events", e))?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (
                snapshot_id, workflow_id, org_id, step_number, last_event_seq,
                state_inline, state_blob_key, state_checksum, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&record.snapshot_id)
        .bind(&record.workflow_id)
        .bind(&record.org_id)
        .bind(record.step_number as i64)
        .bind(record.last_event_seq)
        .bind(&record.state_inline)
        .bind(&record.state_blob_key)
        .bind(&record.state_checksum)
        .bind(format_timestamp(&record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| backend("insert snapshot", e))?;
        Ok(())
    }

    async fn snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query("SELECT * FROM snapshots WHERE snapshot_id = ?1")
            .bind(snapshot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("select snapshot", e))?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    async fn latest_snapshot(
        &self,
        workflow_id: &str,
        org_id: &str,
    ) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM snapshots
            WHERE workflow_id = ?1 AND org_id = ?2
            ORDER BY last_event_seq DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("select latest snapshot", e))?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    async fn snapshot_at(
        &self,
        workflow_id: &str,
        org_id: &str,
        max_seq: i64,
    ) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM snapshots
            WHERE workflow_id = ?1 AND org_id = ?2 AND last_event_seq <= ?3
            ORDER BY last_event_seq DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(org_id)
        .bind(max_seq)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("select snapshot at seq", e))?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    #[instrument(skip(self), err)]
    async fn try_acquire_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("tx begin", e))?;

        // Bump the high-water mark first; on rollback the bump is
        // discarded, and the row lock serializes concurrent acquires.
        let token: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO fencing_counters (workflow_id, org_id, last_token)
            VALUES (?1, ?2, 1)
            ON CONFLICT (workflow_id, org_id) DO UPDATE SET last_token = last_token + 1
            RETURNING last_token
            "#,
        )
        .bind(workflow_id)
        .bind(org_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| backend("token allocation", e))?;

        let held: Option<String> = sqlx::query_scalar(
            r#"
            SELECT lease_expires_at FROM workflow_leases
            WHERE workflow_id = ?1 AND org_id = ?2
            "#,
        )
        .bind(workflow_id)
        .bind(org_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| backend("lease lookup", e))?;

        if let Some(expires) = held {
            let current_expiry = parse_timestamp(&expires, "lease_expires_at")?;
            // Still held at (or past) this instant: no takeover at equality.
            if current_expiry >= now {
                tx.rollback().await.map_err(|e| backend("tx rollback", e))?;
                return Ok(None);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_leases (
                workflow_id, org_id, owner_id, acquired_at,
                lease_expires_at, fencing_token, heartbeat_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (workflow_id, org_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                acquired_at = excluded.acquired_at,
                lease_expires_at = excluded.lease_expires_at,
                fencing_token = excluded.fencing_token,
                heartbeat_at = excluded.heartbeat_at
            "#,
        )
        .bind(workflow_id)
        .bind(org_id)
        .bind(owner_id)
        .bind(format_timestamp(&now))
        .bind(format_timestamp(&expires_at))
        .bind(token)
        .bind(format_timestamp(&now))
        .execute(&mut *tx)
        .await
        .map_err(|e| backend("upsert lease", e))?;

        tx.commit().await.map_err(|e| backend("tx commit", e))?;

        Ok(Some(LeaseRecord {
            workflow_id: workflow_id.to_string(),
            org_id: org_id.to_string(),
            owner_id: owner_id.to_string(),
            fencing_token: token as u64,
            acquired_at: now,
            lease_expires_at: expires_at,
            heartbeat_at: now,
        }))
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
        let result = sqlx::query(
            r#"
            UPDATE workflow_leases
            SET heartbeat_at = ?1, lease_expires_at = ?2
            WHERE workflow_id = ?3 AND org_id = ?4
              AND owner_id = ?5 AND fencing_token = ?6
            "#,
        )
        .bind(format_timestamp(&now))
        .bind(format_timestamp(&expires_at))
        .bind(workflow_id)
        .bind(org_id)
        .bind(owner_id)
        .bind(token as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("renew lease", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, workflow_id: &str, org_id: &str, token: u64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_leases
            WHERE workflow_id = ?1 AND org_id = ?2 AND fencing_token = ?3
            "#,
        )
        .bind(workflow_id)
        .bind(org_id)
        .bind(token as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("release lease", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn current_lease(
        &self,
        workflow_id: &str,
        org_id: &str,
    ) -> Result<Option<LeaseRecord>> {
        let row = sqlx::query(
            "SELECT * FROM workflow_leases WHERE workflow_id = ?1 AND org_id = ?2",
        )
        .bind(workflow_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("select lease", e))?;
        row.as_ref().map(Self::row_to_lease).transpose()
    }

    async fn insert_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        attempt_id: i64,
        started_at: DateTime<Utc>,
        fence: &Fence,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| backend("tx begin", e))?;
        check_fence(&mut tx, workflow_id, fence).await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO step_attempts (
                workflow_id, step_id, attempt_id, fencing_token, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(workflow_id)
        .bind(step_id)
        .bind(attempt_id)
        .bind(fence.token as i64)
        .bind(format_timestamp(&started_at))
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(|e| backend("tx commit", e))?;
                Ok(true)
            }
            Err(error) if is_unique_violation(&error) => {
                tx.rollback().await.map_err(|e| backend("tx rollback", e))?;
                Ok(false)
            }
            Err(error) => Err(backend("insert attempt", error)),
        }
    }

    async fn insert_completion(&self, record: &CompletionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO completed_steps (
                workflow_id, step_id, attempt_id, completed_at,
                result_snapshot_ref, result_checksum
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.workflow_id)
        .bind(&record.step_id)
        .bind(record.attempt_id)
        .bind(format_timestamp(&record.completed_at))
        .bind(&record.result_snapshot_ref)
        .bind(&record.result_checksum)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("insert completion", e))?;
        Ok(())
    }

    async fn completion(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletionRecord>> {
        let row = sqlx::query(
            "SELECT * FROM completed_steps WHERE workflow_id = ?1 AND step_id = ?2",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("select completion", e))?;
        row.map(|row| {
            let completed_at: String = row.get("completed_at");
            Ok(CompletionRecord {
                workflow_id: row.get("workflow_id"),
                step_id: row.get("step_id"),
                attempt_id: row.get("attempt_id"),
                completed_at: parse_timestamp(&completed_at, "completed_at")?,
                result_snapshot_ref: row.get("result_snapshot_ref"),
                result_checksum: row.get("result_checksum"),
            })
        })
        .transpose()
    }
}
