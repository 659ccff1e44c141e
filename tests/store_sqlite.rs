#![cfg(feature = "sqlite")]

use std::sync::Arc;

use serde_json::json;
use stepledger::engine::{Engine, EngineConfig};
use stepledger::events::EventKind;
use stepledger::runtime::WorkflowOptions;
use stepledger::serialization::JsonMap;
use stepledger::store::{FsBlobStore, SqliteStore, Store};

async fn sqlite_engine(dir: &tempfile::TempDir) -> (Engine, Arc<SqliteStore>) {
    let db_path = dir.path().join("stepledger.db");
    let url = format!("sqlite://{}", db_path.display());
    let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs")));
    let engine = Engine::builder()
        .store(store.clone() as Arc<dyn Store>)
        .blobs(blobs)
        .config(EngineConfig {
            snapshot_every: 3,
            ..EngineConfig::default()
        })
        .build();
    (engine, store)
}

async fn run_counting(
    engine: &Engine,
    workflow_id: Option<&str>,
    steps: u64,
) -> (String, JsonMap) {
    let mut options = WorkflowOptions::new("counting");
    if let Some(id) = workflow_id {
        options = options.with_workflow_id(id);
    }
    engine
        .run_workflow(options, |ctx| async move {
            for _ in 0..steps {
                ctx.step("bump", |vars| async move {
                    let current = vars.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                    let mut updates = JsonMap::new();
                    updates.insert("count".into(), json!(current + 1));
                    Ok(updates)
                })
                .await?;
            }
            Ok((ctx.workflow_id().to_string(), ctx.variables()?))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn workflow_runs_and_resumes_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, store) = sqlite_engine(&dir).await;

    let (workflow_id, vars) = run_counting(&engine, None, 4).await;
    assert_eq!(vars["count"], json!(4));

    // Dense sequences and valid checksums straight off the disk.
    let events = engine.journal().events(&workflow_id, -1, true).await.unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.event_seq).collect();
    assert_eq!(seqs, (1..=(seqs.len() as i64)).collect::<Vec<i64>>());

    // The checkpoint policy wrote a snapshot at step 3.
    let snapshot = store.latest_snapshot(&workflow_id, "default").await.unwrap().unwrap();
    assert_eq!(snapshot.step_number, 3);
    assert!(snapshot.state_inline.is_some());

    // Resume and keep counting; the restored state carries the total.
    let (_, vars) = run_counting(&engine, Some(workflow_id.as_str()), 2).await;
    assert_eq!(vars["count"], json!(6));

    let kinds: Vec<EventKind> = engine
        .journal()
        .events(&workflow_id, -1, true)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind())
        .collect();
    assert_eq!(kinds.first(), Some(&EventKind::WorkflowStarted));
    assert_eq!(kinds.last(), Some(&EventKind::WorkflowCompleted));
    assert!(kinds.contains(&EventKind::WorkflowRestored));
}

#[tokio::test]
async fn fencing_survives_process_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fencing.db");
    let url = format!("sqlite://{}", db_path.display());

    let mut seen = Vec::new();
    for _ in 0..3 {
        // A fresh connection each round, as a restarted executor would open.
        let store = SqliteStore::connect(&url).await.unwrap();
        let now = stepledger::events::utc_now_micros();
        let lease = store
            .try_acquire_lease(
                "wf-f",
                "default",
                "executor",
                now,
                now + chrono::TimeDelta::seconds(60),
            )
            .await
            .unwrap()
            .unwrap();
        seen.push(lease.fencing_token);
        store.release_lease("wf-f", "default", lease.fencing_token).await.unwrap();
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn restore_matches_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _) = sqlite_engine(&dir).await;
    let (workflow_id, vars) = run_counting(&engine, None, 5).await;

    // A second engine over the same database sees identical state.
    let (second_engine, _) = sqlite_engine(&dir).await;
    let (state, _) = second_engine
        .recovery()
        .restore(&workflow_id, "default")
        .await
        .unwrap();
    assert_eq!(state.variables, vars);
    assert!(state.verify_checksum().unwrap());
}
