#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::flows::{Greeting, Sum, record_step, take_steps};
use common::helpers::create_engine;
use hibernate::{FlowError, FlowStatus, Id, Outcome, ResumeOutcome, Task, when_any};
use serde_json::json;
use std::collections::HashSet;

// ============================================================================
// Step Consumption Tests
// ============================================================================

#[tokio::test]
async fn test_second_resume_reports_consumed_step() {
    let engine = create_engine();

    let started = engine
        .start(Task::from_continuation(Greeting::new("ada")))
        .await
        .unwrap();
    let step = take_steps(started.flow_id())[0];

    engine
        .resume_with(step, &"first".to_string())
        .await
        .unwrap();
    let err = engine
        .resume_with(step, &"second".to_string())
        .await
        .unwrap_err();
    assert!(
        matches!(err, FlowError::StepConsumed { step_id } if step_id == step),
        "unexpected error: {err}"
    );

    // The flow kept the first result.
    let record = engine.record(started.flow_id()).await.unwrap().unwrap();
    assert_eq!(record.outcome, Some(Outcome::Succeeded(json!("ada: first"))));
}

#[tokio::test]
async fn test_unknown_step_is_not_found() {
    let engine = create_engine();
    let step = Id::new_step();

    let err = engine
        .resume_with(step, &"anyone?".to_string())
        .await
        .unwrap_err();
    assert!(
        matches!(err, FlowError::FrameNotFound { step_id } if step_id == step),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_step_ids_round_trip_through_text() {
    let engine = create_engine();

    let started = engine
        .start(Task::from_continuation(Greeting::new("ada")))
        .await
        .unwrap();
    let step = take_steps(started.flow_id())[0];

    // Triggers usually arrive as text, e.g. in a callback URL.
    let text = step.to_string();
    let parsed = Id::parse(&text).unwrap();
    assert_eq!(parsed, step);
    assert!(parsed.is_step());
    assert!(started.flow_id().is_flow());

    let result = engine
        .resume_with(parsed, &"by text".to_string())
        .await
        .unwrap();
    assert!(matches!(result, ResumeOutcome::Completed { .. }));
}

// ============================================================================
// Concurrent Resume Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_of_one_step_apply_once() {
    let engine = create_engine();

    let started = engine
        .start(Task::from_continuation(Greeting::new("ada")))
        .await
        .unwrap();
    let step = take_steps(started.flow_id())[0];

    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.resume_with(step, &format!("reply-{i}")).await
        }));
    }

    let mut completed = 0;
    let mut consumed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ResumeOutcome::Completed { .. }) => completed += 1,
            Err(err) if err.is_consumed() => consumed += 1,
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert_eq!(completed, 1, "exactly one trigger wins");
    assert_eq!(consumed, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_children_of_when_all_all_land() {
    let engine = create_engine();
    let count = 16u32;

    let started = engine
        .start(Task::from_continuation(Sum { state: 0, count }))
        .await
        .unwrap();
    let flow_id = started.flow_id();
    let steps = take_steps(flow_id);
    assert_eq!(steps.len(), count as usize);

    let mut handles = Vec::new();
    for (i, step) in steps.iter().copied().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.resume_with(step, &(i as u32 + 1)).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    let completions: Vec<_> = outcomes
        .iter()
        .filter_map(ResumeOutcome::outcome)
        .collect();
    assert_eq!(completions.len(), 1, "the last child completes the flow");
    assert_eq!(completions[0], &Outcome::Succeeded(json!(136)));
    assert_eq!(
        engine.status(flow_id).await.unwrap(),
        Some(FlowStatus::Succeeded)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_flows_do_not_block_each_other() {
    let engine = create_engine();

    let mut steps = Vec::new();
    let mut flows = HashSet::new();
    for i in 0..10 {
        let started = engine
            .start(Task::from_continuation(Greeting::new(&format!("user-{i}"))))
            .await
            .unwrap();
        flows.insert(started.flow_id());
        steps.push(take_steps(started.flow_id())[0]);
    }
    assert_eq!(flows.len(), 10, "flow ids are unique");

    let handles: Vec<_> = steps
        .into_iter()
        .map(|step| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.resume_with(step, &"ok".to_string()).await })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(matches!(result, ResumeOutcome::Completed { .. }));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_when_any_children_finish_the_flow_once() {
    let engine = create_engine();

    for _ in 0..50 {
        let started = engine
            .start(when_any([
                Task::<String>::suspend(record_step),
                Task::<String>::suspend(record_step),
            ]))
            .await
            .unwrap();
        let flow_id = started.flow_id();
        let steps = take_steps(flow_id);
        assert_eq!(steps.len(), 2);

        let handles: Vec<_> = steps
            .iter()
            .copied()
            .enumerate()
            .map(|(i, step)| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.resume_with(step, &format!("branch-{i}")).await })
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(ResumeOutcome::Completed { .. }) => completed += 1,
                Ok(ResumeOutcome::Detached { .. }) => {}
                Err(err) if err.is_consumed() => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(completed, 1, "exactly one branch finishes the flow");

        let record = engine.record(flow_id).await.unwrap().unwrap();
        assert_eq!(record.status, FlowStatus::Succeeded);
        assert!(matches!(record.outcome, Some(Outcome::Succeeded(_))));
        assert!(!engine.request_cancel(flow_id).await.unwrap());
        assert!(engine.pending_steps(flow_id).await.unwrap().is_empty());
    }
}
