use serde_json::json;
use stepledger::idempotency::IdempotencyError;
use stepledger::serialization::sha256_hex;
use stepledger::state::WorkflowState;
use stepledger::store::{CompletionRecord, Store, StoreError};

mod common;
use common::*;

fn seed_state(workflow_id: &str) -> WorkflowState {
    WorkflowState::initial(workflow_id, "default", "idem", "2026-08-01T00:00:00.000000Z").unwrap()
}

#[tokio::test]
async fn attempts_allocate_smallest_free_id() {
    let (engine, _, _) = memory_engine();
    let lease = engine.leases().acquire("wf-i", "default", "e1").await.unwrap().unwrap();

    for expected in 1..=3 {
        let attempt = engine
            .idempotency()
            .allocate_attempt("wf-i", "fetch_0", &lease)
            .await
            .unwrap();
        assert_eq!(attempt, expected);
    }
    // Another step starts back at 1.
    let attempt = engine
        .idempotency()
        .allocate_attempt("wf-i", "parse_1", &lease)
        .await
        .unwrap();
    assert_eq!(attempt, 1);
}

#[tokio::test]
async fn stale_fence_cannot_allocate() {
    let (engine, _, _) = memory_engine();
    let leases = engine.leases();
    let first = leases.acquire("wf-i", "default", "e1").await.unwrap().unwrap();
    leases.release(&first).await.unwrap();
    let _second = leases.acquire("wf-i", "default", "e2").await.unwrap().unwrap();

    let err = engine
        .idempotency()
        .allocate_attempt("wf-i", "fetch_0", &first)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IdempotencyError::Store(StoreError::StaleFence { .. })
    ));
}

#[tokio::test]
async fn mark_and_check_round_trip() {
    let (engine, _, _) = memory_engine();
    let state = seed_state("wf-i").with_variable("done", json!(true)).unwrap();

    assert!(
        engine
            .idempotency()
            .check_completed("wf-i", "fetch_0")
            .await
            .unwrap()
            .is_none()
    );

    engine
        .idempotency()
        .mark_completed("wf-i", "fetch_0", 1, &state, 4)
        .await
        .unwrap();

    let cached = engine
        .idempotency()
        .check_completed("wf-i", "fetch_0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached, state);
}

#[tokio::test]
async fn first_completion_wins() {
    let (engine, store, _) = memory_engine();
    let first = seed_state("wf-i").with_variable("winner", json!(1)).unwrap();
    let second = seed_state("wf-i").with_variable("winner", json!(2)).unwrap();

    engine
        .idempotency()
        .mark_completed("wf-i", "fetch_0", 1, &first, 2)
        .await
        .unwrap();
    engine
        .idempotency()
        .mark_completed("wf-i", "fetch_0", 2, &second, 3)
        .await
        .unwrap();

    let record = store.completion("wf-i", "fetch_0").await.unwrap().unwrap();
    assert_eq!(record.attempt_id, 1);
    let cached = engine
        .idempotency()
        .check_completed("wf-i", "fetch_0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.variables["winner"], json!(1));
}

#[tokio::test]
async fn mismatched_result_checksum_is_corruption() {
    let (engine, store, _) = memory_engine();
    let state = seed_state("wf-i");
    let snapshot_ref = engine.snapshots().save(&state, 1).await.unwrap();

    // Completion row pointing at a valid snapshot but recording a checksum
    // for different bytes.
    store
        .insert_completion(&CompletionRecord {
            workflow_id: "wf-i".into(),
            step_id: "fetch_0".into(),
            attempt_id: 1,
            completed_at: stepledger::events::utc_now_micros(),
            result_snapshot_ref: snapshot_ref,
            result_checksum: sha256_hex(b"other bytes entirely"),
        })
        .await
        .unwrap();

    let err = engine
        .idempotency()
        .check_completed("wf-i", "fetch_0")
        .await
        .unwrap_err();
    assert!(matches!(err, IdempotencyError::ResultCorruption { .. }));
}
