//! Multi-tenancy and cross-workflow independence.

use serde_json::json;
use stepledger::engine::Engine;
use stepledger::runtime::{WorkflowError, WorkflowOptions};
use stepledger::serialization::JsonMap;
use stepledger::store::Store;

mod common;
use common::*;

async fn run_tagged(
    engine: &Engine,
    options: WorkflowOptions,
    label: &str,
) -> Result<(String, JsonMap), WorkflowError> {
    let label = label.to_string();
    engine
        .run_workflow(options, |ctx| async move {
            ctx.step("label", move |_vars| {
                let label = label.clone();
                async move { Ok(updates(&[("label", json!(label))])) }
            })
            .await?;
            Ok((ctx.workflow_id().to_string(), ctx.variables()?))
        })
        .await
}

#[tokio::test]
async fn orgs_do_not_share_leases_or_snapshots() {
    let (engine, store, _) = memory_engine();

    // Same workflow id, two orgs: the lease rows are disjoint, so both may
    // hold "their" workflow at once.
    let a = engine.leases().acquire("wf-x", "org-a", "e1").await.unwrap();
    let b = engine.leases().acquire("wf-x", "org-b", "e2").await.unwrap();
    assert!(a.is_some());
    assert!(b.is_some());

    // Snapshot lookups are org-scoped.
    let state =
        stepledger::state::WorkflowState::initial("wf-x", "org-a", "iso", "2026-08-01T00:00:00.000000Z")
            .unwrap();
    engine.snapshots().save(&state, 1).await.unwrap();
    assert!(store.latest_snapshot("wf-x", "org-a").await.unwrap().is_some());
    assert!(store.latest_snapshot("wf-x", "org-b").await.unwrap().is_none());
}

#[tokio::test]
async fn parallel_workflows_on_one_engine_are_independent() {
    let (engine, _, _) = memory_engine();

    let left = run_tagged(&engine, WorkflowOptions::new("pair"), "left");
    let right = run_tagged(&engine, WorkflowOptions::new("pair"), "right");
    let (left, right) = tokio::join!(left, right);
    let (left_id, left_vars) = left.unwrap();
    let (right_id, right_vars) = right.unwrap();

    assert_ne!(left_id, right_id);
    assert_eq!(left_vars["label"], json!("left"));
    assert_eq!(right_vars["label"], json!("right"));

    // Each journal is dense on its own; no cross-workflow interleaving of
    // sequences.
    for id in [&left_id, &right_id] {
        let events = engine.journal().events(id, -1, true).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.event_seq).collect();
        assert_eq!(seqs, (1..=(seqs.len() as i64)).collect::<Vec<i64>>());
    }
}

#[tokio::test]
async fn tags_reach_state_metadata_and_survive_replay() {
    let (engine, _, _) = memory_engine();
    let options = WorkflowOptions::new("tagged")
        .with_tag("team", "search")
        .with_tag("priority", "high");
    let (workflow_id, _) = run_tagged(&engine, options, "x").await.unwrap();

    let (state, _) = engine.restore(&workflow_id, "default").await.unwrap();
    let tags = state.metadata["tags"].as_object().unwrap();
    assert_eq!(tags["team"], json!("search"));
    assert_eq!(tags["priority"], json!("high"));
}

#[tokio::test]
async fn runtime_tag_updates_are_journaled_with_the_next_step() {
    let (engine, _, _) = memory_engine();
    let (workflow_id, _) = engine
        .run_workflow(WorkflowOptions::new("retagged"), |ctx| async move {
            ctx.step("first", |_vars| async move { Ok(JsonMap::new()) }).await?;
            let mut extra = rustc_hash::FxHashMap::default();
            extra.insert("phase".to_string(), "review".to_string());
            ctx.update_tags(&extra)?;
            ctx.step("second", |_vars| async move { Ok(JsonMap::new()) }).await?;
            Ok((ctx.workflow_id().to_string(), ()))
        })
        .await
        .unwrap();

    let (state, _) = engine.restore(&workflow_id, "default").await.unwrap();
    assert_eq!(state.metadata["tags"]["phase"], json!("review"));
    assert!(state.verify_checksum().unwrap());
}

#[tokio::test]
async fn explicit_owner_id_is_used_for_the_lease() {
    let (engine, store, _) = memory_engine();
    let options = WorkflowOptions::new("owned").with_owner_id("executor-7");
    let probe = store.clone();
    let (workflow_id, _) = engine
        .run_workflow(options, |ctx| async move {
            assert_eq!(ctx.executor_id(), "executor-7");
            let lease = probe
                .current_lease(ctx.workflow_id(), "default")
                .await
                .expect("store reachable")
                .expect("lease held while running");
            assert_eq!(lease.owner_id, "executor-7");
            Ok((ctx.workflow_id().to_string(), ()))
        })
        .await
        .unwrap();
    // Released after completion.
    assert!(store.current_lease(&workflow_id, "default").await.unwrap().is_none());
}
