use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use stepledger::engine::{Engine, EngineConfig};
use stepledger::events::{Event, EventKind, EventPayload, format_timestamp, utc_now_micros};
use stepledger::runtime::{
    ExecutionContext, RetryPolicy, StepConfig, StepError, WorkflowError, WorkflowOptions,
};
use stepledger::serialization::JsonMap;
use stepledger::store::Store;

mod common;
use common::*;

/// Run a workflow that bumps a counter `steps` times; returns
/// `(workflow_id, final_variables)`.
async fn run_counting(
    engine: &Engine,
    workflow_id: Option<&str>,
    steps: u64,
) -> Result<(String, JsonMap), WorkflowError> {
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
}

async fn kinds(engine: &Engine, workflow_id: &str) -> Vec<EventKind> {
    engine
        .journal()
        .events(workflow_id, -1, true)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind())
        .collect()
}

#[tokio::test]
async fn lifecycle_emits_the_canonical_event_sequence() {
    let (engine, store, _) = memory_engine();
    let (workflow_id, vars) = run_counting(&engine, None, 2).await.unwrap();
    assert_eq!(vars["count"], json!(2));

    let kinds = kinds(&engine, &workflow_id).await;
    assert_eq!(
        kinds,
        vec![
            EventKind::WorkflowStarted,
            EventKind::StepIntention,
            EventKind::StepCompleted,
            EventKind::StepIntention,
            EventKind::StepCompleted,
            EventKind::WorkflowCompleted,
        ]
    );

    // Sequence density: seqs are exactly 1..=N.
    let events = engine.journal().events(&workflow_id, -1, true).await.unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.event_seq).collect();
    assert_eq!(seqs, (1..=6).collect::<Vec<i64>>());

    // Lease released on the way out.
    assert!(store.current_lease(&workflow_id, "default").await.unwrap().is_none());
}

#[tokio::test]
async fn completion_always_follows_its_intention() {
    let (engine, _, _) = memory_engine();
    let (workflow_id, _) = run_counting(&engine, None, 3).await.unwrap();

    let events = engine.journal().events(&workflow_id, -1, true).await.unwrap();
    let mut intention_seq = None;
    for event in &events {
        match &event.payload {
            EventPayload::StepIntention { step_id, .. } => {
                intention_seq = Some((step_id.clone(), event.event_seq));
            }
            EventPayload::StepCompleted { step_id, .. } => {
                let (pending_id, seq) = intention_seq.take().unwrap();
                assert_eq!(&pending_id, step_id);
                assert!(event.event_seq > seq);
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn step_ids_are_deterministic_across_replay() {
    // Scenario: compute_0..compute_2 on first run; after a resume from the
    // snapshot taken past compute_1, the next id must be compute_2.
    let config = EngineConfig {
        snapshot_every: 2,
        ..EngineConfig::default()
    };
    let (engine, store, _) = memory_engine_with(config);

    let (workflow_id, _) = run_counting(&engine, None, 2).await.unwrap();
    let snapshot = store.latest_snapshot(&workflow_id, "default").await.unwrap().unwrap();
    assert_eq!(snapshot.step_number, 2);

    let step_ids = |events: &[Event]| -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::StepIntention { step_id, .. } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    };
    let events = engine.journal().events(&workflow_id, -1, true).await.unwrap();
    assert_eq!(step_ids(&events), vec!["bump_0", "bump_1"]);

    // Resume and run one more step.
    let (_, vars) = run_counting(&engine, Some(workflow_id.as_str()), 1).await.unwrap();
    assert_eq!(vars["count"], json!(3));

    let events = engine.journal().events(&workflow_id, -1, true).await.unwrap();
    assert_eq!(step_ids(&events), vec!["bump_0", "bump_1", "bump_2"]);
}

#[tokio::test]
async fn crash_between_intention_and_completion_reexecutes_once() {
    // Scenario A: the first executor dies after writing the intention; the
    // takeover re-runs the step under a fresh attempt and exactly one
    // completion row exists afterwards.
    let (engine, store, _) = memory_engine();
    let workflow_id = "wf-a";

    // First executor: workflow.started, then an intention for task_0, then
    // the process dies (simulated by releasing without completing).
    let lease = engine.leases().acquire(workflow_id, "default", "e1").await.unwrap().unwrap();
    let started_at = format_timestamp(&utc_now_micros());
    engine
        .journal()
        .append(
            Event::new(
                workflow_id,
                "default",
                EventPayload::WorkflowStarted {
                    workflow_name: "counting".into(),
                    tags: Default::default(),
                    started_at,
                },
            ),
            Some(&lease),
        )
        .await
        .unwrap();
    let first_attempt = engine
        .idempotency()
        .allocate_attempt(workflow_id, "task_0", &lease)
        .await
        .unwrap();
    assert_eq!(first_attempt, 1);
    engine
        .journal()
        .append(
            Event::new(
                workflow_id,
                "default",
                EventPayload::StepIntention {
                    step_id: "task_0".into(),
                    step_name: "task".into(),
                    attempt_id: first_attempt,
                },
            ),
            Some(&lease),
        )
        .await
        .unwrap();
    engine.leases().release(&lease).await.unwrap();

    // Takeover executor resumes and runs the step to completion.
    let executions = Arc::new(AtomicU64::new(0));
    let observed = executions.clone();
    let options = WorkflowOptions::new("counting").with_workflow_id(workflow_id);
    engine
        .run_workflow(options, |ctx| {
            let executions = observed.clone();
            async move {
                ctx.step("task", move |_vars| {
                    let executions = executions.clone();
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        let mut updates = JsonMap::new();
                        updates.insert("ran".into(), json!(true));
                        Ok(updates)
                    }
                })
                .await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let completion = store.completion(workflow_id, "task_0").await.unwrap().unwrap();
    assert_eq!(completion.attempt_id, 2);

    // Orphan intention (attempt 1) plus the takeover's intention and one
    // completion.
    let events = engine.journal().events(workflow_id, -1, true).await.unwrap();
    let intentions = events
        .iter()
        .filter(|e| e.kind() == EventKind::StepIntention)
        .count();
    let completions = events
        .iter()
        .filter(|e| e.kind() == EventKind::StepCompleted)
        .count();
    assert_eq!(intentions, 2);
    assert_eq!(completions, 1);
}

#[tokio::test]
async fn locked_workflow_is_refused() {
    let (engine, _, _) = memory_engine();
    let (workflow_id, _) = run_counting(&engine, None, 1).await.unwrap();

    // Another executor currently holds the lease.
    let _held = engine
        .leases()
        .acquire(&workflow_id, "default", "other-executor")
        .await
        .unwrap()
        .unwrap();

    let err = run_counting(&engine, Some(workflow_id.as_str()), 1).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Locked { .. }));
}

#[tokio::test]
async fn stale_executor_writes_are_fenced_after_takeover() {
    // Scenario B: after a takeover, the old owner's fenced appends are
    // rejected and only the new owner's writes land in the journal.
    let (engine, store, _) = memory_engine();
    let workflow_id = "wf-b";
    let now = utc_now_micros();

    let old = store
        .try_acquire_lease(
            workflow_id,
            "default",
            "e1",
            now - chrono::TimeDelta::seconds(400),
            now - chrono::TimeDelta::seconds(100),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.fencing_token, 1);

    // E1 ran long enough for its lease to lapse; E2 takes over.
    let new = store
        .try_acquire_lease(
            workflow_id,
            "default",
            "e2",
            now,
            now + chrono::TimeDelta::seconds(300),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new.fencing_token, 2);

    let stale_lease = stepledger::leases::Lease {
        workflow_id: workflow_id.into(),
        org_id: "default".into(),
        owner_id: "e1".into(),
        fencing_token: old.fencing_token,
        acquired_at: old.acquired_at,
        expires_at: old.lease_expires_at,
    };
    let err = engine
        .journal()
        .append(
            Event::new(
                workflow_id,
                "default",
                EventPayload::Annotation {
                    step_number: 0,
                    step_name: "step_0".into(),
                    text: "stale write".into(),
                },
            ),
            Some(&stale_lease),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        stepledger::journal::JournalError::Store(stepledger::store::StoreError::StaleFence {
            presented: 1,
            current: 2,
            ..
        })
    ));

    let live_lease = stepledger::leases::Lease {
        workflow_id: workflow_id.into(),
        org_id: "default".into(),
        owner_id: "e2".into(),
        fencing_token: new.fencing_token,
        acquired_at: new.acquired_at,
        expires_at: new.lease_expires_at,
    };
    engine
        .journal()
        .append(
            Event::new(
                workflow_id,
                "default",
                EventPayload::Annotation {
                    step_number: 0,
                    step_name: "step_0".into(),
                    text: "live write".into(),
                },
            ),
            Some(&live_lease),
        )
        .await
        .unwrap();

    let events = engine.journal().events(workflow_id, -1, true).await.unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].payload {
        EventPayload::Annotation { text, .. } => assert_eq!(text, "live write"),
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn retries_allocate_fresh_attempts_and_then_succeed() {
    let (engine, store, _) = memory_engine();
    let failures = Arc::new(AtomicU64::new(0));
    let observed = failures.clone();

    let options = WorkflowOptions::new("flaky")
        .with_retry(RetryPolicy::default().with_max_attempts(3).with_backoff(0.001, 0.01));
    let (workflow_id, _) = engine
        .run_workflow(options, |ctx| {
            let failures = observed.clone();
            async move {
                ctx.step("wobble", move |_vars| {
                    let failures = failures.clone();
                    async move {
                        if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err(StepError::msg("transient"));
                        }
                        let mut updates = JsonMap::new();
                        updates.insert("ok".into(), json!(true));
                        Ok(updates)
                    }
                })
                .await?;
                Ok((ctx.workflow_id().to_string(), ()))
            }
        })
        .await
        .unwrap();

    assert_eq!(failures.load(Ordering::SeqCst), 3);
    let completion = store.completion(&workflow_id, "wobble_0").await.unwrap().unwrap();
    assert_eq!(completion.attempt_id, 3);

    let events = engine.journal().events(&workflow_id, -1, true).await.unwrap();
    let failed = events
        .iter()
        .filter(|e| e.kind() == EventKind::StepFailed)
        .count();
    assert_eq!(failed, 2);
}

#[tokio::test]
async fn retry_exhaustion_reraises_the_last_failure() {
    let (engine, store, _) = memory_engine();
    let options = WorkflowOptions::new("doomed")
        .with_retry(RetryPolicy::default().with_max_attempts(3).with_backoff(0.001, 0.01));
    let err = engine
        .run_workflow(options, |ctx| async move {
            ctx.step("explode", |_vars| async move {
                Err::<JsonMap, _>(StepError::msg("permanent"))
            })
            .await?;
            Ok(())
        })
        .await
        .unwrap_err();

    match err {
        WorkflowError::StepFailed {
            step_id, attempts, ..
        } => {
            assert_eq!(step_id, "explode_0");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    // No completion row was written for the failed step.
    assert!(
        store
            .completion("wf-unknown", "explode_0")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn timeout_counts_as_step_failure() {
    let (engine, _, _) = memory_engine();
    let config = StepConfig::new()
        .with_timeout(Duration::from_millis(20))
        .with_retry(RetryPolicy::none());
    let err = engine
        .run_workflow(WorkflowOptions::new("slow"), |ctx| {
            let config = config.clone();
            async move {
                ctx.step_with("sleepy", &config, |_vars| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(JsonMap::new())
                })
                .await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

    match err {
        WorkflowError::StepFailed { source, .. } => {
            assert!(matches!(source, StepError::Timeout { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn body_errors_surface_after_lease_release() {
    let (engine, store, _) = memory_engine();
    let err = engine
        .run_workflow(WorkflowOptions::new("broken"), |ctx| async move {
            let _ = ctx.workflow_id();
            Err::<(), _>(WorkflowError::body("user logic gave up"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Body { .. }));

    // No workflow.failed is synthesized, and no lease lingers. The id was
    // generated, so scan for any lingering lease by checking the only
    // workflow in the store has been released; a fresh acquire of any id
    // must succeed.
    let lease = store
        .try_acquire_lease(
            "wf-probe",
            "default",
            "probe",
            utc_now_micros(),
            utc_now_micros() + chrono::TimeDelta::seconds(1),
        )
        .await
        .unwrap();
    assert!(lease.is_some());
}

#[tokio::test]
async fn prepopulated_completion_short_circuits_the_step() {
    let (engine, _, _) = memory_engine();
    let workflow_id = "wf-cached";

    // History: a started workflow plus a completion row for task_0 whose
    // result state is already at step 1.
    let lease = engine.leases().acquire(workflow_id, "default", "e1").await.unwrap().unwrap();
    let started_at = format_timestamp(&utc_now_micros());
    engine
        .journal()
        .append(
            Event::new(
                workflow_id,
                "default",
                EventPayload::WorkflowStarted {
                    workflow_name: "cached".into(),
                    tags: Default::default(),
                    started_at: started_at.clone(),
                },
            ),
            Some(&lease),
        )
        .await
        .unwrap();
    let base = stepledger::state::WorkflowState::from_started(
        workflow_id,
        "default",
        "cached",
        &started_at,
        &Default::default(),
    )
    .unwrap();
    let done = base.advanced(updates(&[("precomputed", json!(99))])).unwrap();
    engine
        .idempotency()
        .mark_completed(workflow_id, "task_0", 1, &done, 1)
        .await
        .unwrap();
    engine.leases().release(&lease).await.unwrap();

    let executions = Arc::new(AtomicU64::new(0));
    let observed = executions.clone();
    let options = WorkflowOptions::new("cached").with_workflow_id(workflow_id);
    let vars = engine
        .run_workflow(options, |ctx| {
            let executions = observed.clone();
            async move {
                let vars = ctx
                    .step("task", move |_vars| {
                        let executions = executions.clone();
                        async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            Ok(JsonMap::new())
                        }
                    })
                    .await?;
                Ok(vars)
            }
        })
        .await
        .unwrap();

    // The user function never ran; the cached result state was installed.
    assert_eq!(executions.load(Ordering::SeqCst), 0);
    assert_eq!(vars["precomputed"], json!(99));
}

#[tokio::test]
async fn current_context_resolves_only_inside_a_workflow() {
    assert!(matches!(
        ExecutionContext::current(),
        Err(WorkflowError::NoActiveWorkflow)
    ));

    let (engine, _, _) = memory_engine();
    engine
        .run_workflow(WorkflowOptions::new("ambient"), |ctx| async move {
            let ambient = ExecutionContext::current()?;
            assert_eq!(ambient.workflow_id(), ctx.workflow_id());
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn explicit_idempotency_key_overrides_derived_step_id() {
    let (engine, store, _) = memory_engine();
    let executions = Arc::new(AtomicU64::new(0));
    let observed = executions.clone();

    let (workflow_id, _) = engine
        .run_workflow(WorkflowOptions::new("charges"), |ctx| {
            let executions = observed.clone();
            async move {
                let config = StepConfig::new().with_idempotency_key("charge_order_1234");
                // Two call sites, one external effect: the second call sees
                // the completion row under the shared key and is skipped.
                for _ in 0..2 {
                    ctx.step_with("charge", &config, {
                        let executions = executions.clone();
                        move |_vars| {
                            let executions = executions.clone();
                            async move {
                                executions.fetch_add(1, Ordering::SeqCst);
                                Ok(updates(&[("charged", json!(true))]))
                            }
                        }
                    })
                    .await?;
                }
                Ok((ctx.workflow_id().to_string(), ()))
            }
        })
        .await
        .unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert!(
        store
            .completion(&workflow_id, "charge_order_1234")
            .await
            .unwrap()
            .is_some()
    );
    assert!(store.completion(&workflow_id, "charge_0").await.unwrap().is_none());
}

#[tokio::test]
async fn workflow_deadline_aborts_the_body() {
    let (engine, _, _) = memory_engine();
    let options =
        WorkflowOptions::new("endless").with_max_duration(Duration::from_millis(30));
    let err = engine
        .run_workflow(options, |ctx| async move {
            ctx.step("first", |_vars| async move {
                Ok(updates(&[("reached", json!(1))]))
            })
            .await?;
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::DeadlineExceeded { .. }));
}

#[tokio::test]
async fn savepoints_are_listed_in_journal_order() {
    let (engine, _, _) = memory_engine();
    let (workflow_id, ()) = engine
        .run_workflow(WorkflowOptions::new("marked"), |ctx| async move {
            ctx.step("one", |_vars| async move { Ok(JsonMap::new()) }).await?;
            ctx.create_savepoint(None).await?;
            ctx.step("two", |_vars| async move { Ok(JsonMap::new()) }).await?;
            ctx.create_savepoint(None).await?;
            Ok((ctx.workflow_id().to_string(), ()))
        })
        .await
        .unwrap();

    let savepoints = engine.savepoints(&workflow_id).await.unwrap();
    assert_eq!(savepoints.len(), 2);
    assert_eq!(savepoints[0].step_number, 1);
    assert_eq!(savepoints[1].step_number, 2);
    assert!(savepoints[0].event_seq < savepoints[1].event_seq);
}

#[tokio::test]
async fn set_variable_changes_survive_replay() {
    // A variable set between steps is journaled as part of the next step's
    // delta, so a journal-only restore reproduces it.
    let (engine, _, _) = memory_engine();
    let (workflow_id, vars) = engine
        .run_workflow(WorkflowOptions::new("sets"), |ctx| async move {
            ctx.step("first", |_vars| async move {
                Ok(updates(&[("a", json!(1))]))
            })
            .await?;
            ctx.set_variable("aside", json!("noted"))?;
            ctx.step("second", |_vars| async move {
                Ok(updates(&[("b", json!(2))]))
            })
            .await?;
            Ok((ctx.workflow_id().to_string(), ctx.variables()?))
        })
        .await
        .unwrap();
    assert_eq!(vars["aside"], json!("noted"));

    let (restored, _) = engine.recovery().restore(&workflow_id, "default").await.unwrap();
    assert_eq!(restored.variables, vars);
    assert!(restored.verify_checksum().unwrap());
}
