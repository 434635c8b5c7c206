//! Extraction graph: join ordering, partial failure and fallback behaviour
//!
//! Completion order is driven by scripted collaborator delays under paused
//! tokio time, so every interleaving is deterministic.

mod common;

use common::graph_with;
use narrex::extract::{ErrorKind, GraphEvent, GraphPhase};
use narrex::{InferenceError, MockClient, TaskKind};
use std::sync::Arc;
use std::time::Duration;

const ANALYSES: [TaskKind; 3] = TaskKind::ANALYSES;

fn permutations() -> Vec<[TaskKind; 3]> {
    let [a, b, c] = ANALYSES;
    vec![
        [a, b, c],
        [a, c, b],
        [b, a, c],
        [b, c, a],
        [c, a, b],
        [c, b, a],
    ]
}

// ============================================================================
// Join condition
// ============================================================================

#[tokio::test(start_paused = true)]
async fn merge_runs_once_for_every_completion_order() {
    for order in permutations() {
        let mut mock = MockClient::available();
        for (rank, kind) in order.iter().enumerate() {
            mock = mock.with_delay(*kind, Duration::from_millis(10 * (rank as u64 + 1)));
        }
        let graph = graph_with(Arc::new(mock), 8);

        let run = graph.execute("正文").await.unwrap();

        assert_eq!(run.merges(), 1, "order {:?}", order);
        assert_eq!(
            run.document.completed_tasks,
            vec![TaskKind::Preprocess, order[0], order[1], order[2]],
            "completed_tasks must follow completion order"
        );
        assert!(run.document.analyses().iter().all(|e| e.success));
    }
}

#[tokio::test(start_paused = true)]
async fn simultaneous_completion_merges_once() {
    let mut mock = MockClient::available();
    for kind in ANALYSES {
        mock = mock.with_delay(kind, Duration::from_millis(25));
    }
    let run = graph_with(Arc::new(mock), 8).execute("text").await.unwrap();

    assert_eq!(run.merges(), 1);
    assert_eq!(run.document.completed_tasks.len(), 4);
    let ready_count = run
        .trace
        .iter()
        .filter(|e| **e == GraphEvent::JoinEvaluated { ready: true })
        .count();
    assert_eq!(ready_count, 1);
}

#[tokio::test(start_paused = true)]
async fn merge_waits_for_the_slowest_analysis() {
    let mock = MockClient::available().with_delay(TaskKind::Satisfaction, Duration::from_secs(20));
    let graph = graph_with(Arc::new(mock), 8).with_timeout(Duration::from_secs(60));

    let started = tokio::time::Instant::now();
    let run = graph.execute("text").await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(20));
    assert!(run.document.satisfaction_points.success);
    assert_eq!(run.document.completed_tasks.last(), Some(&TaskKind::Satisfaction));
}

#[tokio::test]
async fn trace_orders_phases() {
    let run = graph_with(Arc::new(MockClient::available()), 8)
        .execute("text")
        .await
        .unwrap();
    let phases: Vec<GraphPhase> = run
        .trace
        .iter()
        .filter_map(|e| match e {
            GraphEvent::Entered(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            GraphPhase::Start,
            GraphPhase::Preprocessing,
            GraphPhase::Analyzing,
            GraphPhase::Merging,
            GraphPhase::Done
        ]
    );
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn any_single_failure_leaves_the_other_two_intact() {
    for failing in ANALYSES {
        let mock = MockClient::available()
            .with_failure(failing, InferenceError::Refusal("declined".into()));
        let run = graph_with(Arc::new(mock), 8).execute("text").await.unwrap();

        for (kind, envelope) in ANALYSES.iter().zip(run.document.analyses()) {
            assert_eq!(envelope.success, *kind != failing, "{} with {} failing", kind, failing);
            assert_eq!(envelope.task_name, kind.as_str());
        }
        assert_eq!(run.document.errors.len(), 1);
        assert!(run.document.errors[0].starts_with(failing.as_str()));
        assert_eq!(run.errors[0].kind, ErrorKind::CollaboratorRefusal);
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_analysis_is_recorded_as_timeout() {
    let mock = MockClient::available().with_delay(TaskKind::Plot, Duration::from_secs(600));
    let graph = graph_with(Arc::new(mock), 8).with_timeout(Duration::from_secs(5));

    let run = graph.execute("text").await.unwrap();

    assert!(!run.document.plot.success);
    assert!(run.document.characters.success);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].kind, ErrorKind::CollaboratorTimeout);
}

#[tokio::test]
async fn total_outage_fails_every_analysis_but_still_merges() {
    let run = graph_with(Arc::new(MockClient::unavailable()), 8)
        .execute("  some   text ")
        .await
        .unwrap();

    assert_eq!(run.merges(), 1);
    assert!(run.document.all_analyses_failed());
    assert_eq!(run.errors.len(), 4);
    assert!(run
        .errors
        .iter()
        .all(|e| e.kind == ErrorKind::CollaboratorUnavailable));
    assert_eq!(run.document.cleaned_text_length, "some text".chars().count());
}

// ============================================================================
// Preprocessing fallback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn analyses_run_on_normalised_text_when_preprocessing_times_out() {
    let mock = MockClient::available().with_delay(TaskKind::Preprocess, Duration::from_secs(120));
    let graph = graph_with(Arc::new(mock), 8).with_timeout(Duration::from_secs(10));

    let run = graph.execute("  林动\n\n  出场\t ").await.unwrap();

    assert!(run.document.analyses().iter().all(|e| e.success));
    assert_eq!(run.document.cleaned_text_length, "林动 出场".chars().count());
    // The mock reports the length of the text it was given.
    let payload = run.document.characters.payload.as_ref().unwrap();
    assert_eq!(payload["chars"], 5);
    assert_eq!(run.errors[0].task, TaskKind::Preprocess);
    assert_eq!(run.errors[0].kind, ErrorKind::CollaboratorTimeout);
}

#[tokio::test]
async fn collaborator_output_is_parsed_as_json_payload() {
    let mock = MockClient::available().with_response(
        TaskKind::Character,
        "Here you go:\n```json\n{\"characters\": [{\"name\": \"林动\", \"role\": \"protagonist\"}]}\n```",
    );
    let run = graph_with(Arc::new(mock), 8).execute("text").await.unwrap();

    let payload = run.document.characters.payload.unwrap();
    assert_eq!(payload["characters"][0]["name"], "林动");
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_graphs_share_the_admission_limit() {
    let mut mock = MockClient::available();
    for kind in [TaskKind::Preprocess, TaskKind::Character, TaskKind::Plot, TaskKind::Satisfaction] {
        mock = mock.with_delay(kind, Duration::from_millis(50));
    }
    let mock = Arc::new(mock);
    let graph = graph_with(mock.clone(), 2);

    let mut handles = Vec::new();
    for i in 0..4 {
        let graph = graph.clone();
        handles.push(tokio::spawn(async move {
            graph.execute(&format!("document {}", i)).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().merges(), 1);
    }

    assert_eq!(mock.total_calls(), 16);
    assert!(mock.peak_in_flight() <= 2);
}
