//! Test: Concurrency groups - newer pull request updates supersede older runs

use crate::helpers::*;
use shipyard::cli::serve::serve;
use shipyard::core::ExecutionStatus;
use shipyard::execution::ExecutionEvent;
use shipyard::persistence::PersistenceBackend;
use shipyard::secrets::MemorySecretStore;
use std::sync::Arc;
use std::time::Duration;

/// Two quick updates to one pull request: only the newest run completes
#[tokio::test]
async fn test_second_update_cancels_first_run() {
    let actions = MockActions::new().with_delay(Duration::from_millis(100));
    let store = archive();
    let dispatcher = dispatcher(actions, Arc::new(MemorySecretStore::new())).with_store(store.clone());
    let events = record_events(&dispatcher);

    let event = pull_request(7, "fix-lexer");
    let mut first = dispatcher.dispatch(&event).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let mut second = dispatcher.dispatch(&event).unwrap();

    let first = first.remove(0).wait().await.unwrap();
    let second = second.remove(0).wait().await.unwrap();

    assert_eq!(first.group, second.group);
    assert_eq!(first.status(), ExecutionStatus::Cancelled);
    assert_eq!(first.status().exit_code(), Some(130));
    assert_eq!(second.status(), ExecutionStatus::Succeeded);

    for job in ["fmt", "clippy", "test"] {
        assert_eq!(job_status(&first, job), ExecutionStatus::Cancelled);
        assert!(step_statuses(&first, job)
            .iter()
            .all(|status| *status != ExecutionStatus::Failed));
    }
    let reason = first.cancel_reason.clone().unwrap();
    assert_eq!(reason, format!("superseded by run {}", second.id));

    // Never both in progress
    let first_done = first.state.lifecycle.finished_at.unwrap();
    let second_started = second.state.lifecycle.started_at.unwrap();
    assert!(second_started >= first_done);

    let archived = store.list_runs("CI", 10).await.unwrap();
    assert_eq!(archived.len(), 2);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        ExecutionEvent::RunCancelled { run_id, .. } if *run_id == first.id
    )));
}

/// A run superseded while still queued never starts
#[tokio::test]
async fn test_queued_run_is_cancelled_before_start() {
    let actions = MockActions::new().with_delay(Duration::from_millis(50));
    let dispatcher = dispatcher(actions, Arc::new(MemorySecretStore::new()));

    let event = pull_request(8, "retry-parser");
    let first = dispatcher.dispatch(&event).unwrap().remove(0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = dispatcher.dispatch(&event).unwrap().remove(0);
    let third = dispatcher.dispatch(&event).unwrap().remove(0);

    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();
    let third = third.wait().await.unwrap();

    assert_eq!(first.status(), ExecutionStatus::Cancelled);
    assert_eq!(second.status(), ExecutionStatus::Cancelled);
    assert_eq!(third.status(), ExecutionStatus::Succeeded);

    assert!(second.state.lifecycle.started_at.is_none());
    assert!(second
        .jobs
        .values()
        .flat_map(|job| job.steps.iter())
        .all(|step| step.status() == ExecutionStatus::Cancelled));
    assert_eq!(
        second.cancel_reason,
        Some(format!("superseded by run {}", third.id))
    );
}

/// Different pull requests have different groups and overlap freely
#[tokio::test]
async fn test_unrelated_pull_requests_run_concurrently() {
    let actions = MockActions::new().with_delay(Duration::from_millis(50));
    let dispatcher = dispatcher(actions, Arc::new(MemorySecretStore::new()));

    let first = dispatcher.dispatch(&pull_request(1, "fix-lexer")).unwrap().remove(0);
    let second = dispatcher.dispatch(&pull_request(2, "docs")).unwrap().remove(0);
    assert_ne!(first.group, second.group);

    let first = first.wait().await.unwrap();
    let second = second.wait().await.unwrap();

    assert_eq!(first.status(), ExecutionStatus::Succeeded);
    assert_eq!(second.status(), ExecutionStatus::Succeeded);
    assert!(second.state.lifecycle.started_at.unwrap() < first.state.lifecycle.finished_at.unwrap());
}

/// Requests fed through one serve session share concurrency groups
#[tokio::test]
async fn test_serve_session_supersedes_earlier_update() {
    let actions = MockActions::new().with_delay(Duration::from_millis(50));
    let dispatcher = dispatcher(actions, Arc::new(MemorySecretStore::new()));
    let input = concat!(
        r#"{"type": "pull_request", "number": 12, "base": "main", "head": "fix-parser"}"#,
        "\n",
        r#"{"type": "pull_request", "number": 12, "base": "main", "head": "fix-parser"}"#,
        "\n",
    );

    let runs = serve(&dispatcher, input.as_bytes(), |_| {}).await.unwrap();

    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].group.as_deref(), Some("CI-fix-parser"));
    assert_eq!(runs[0].status(), ExecutionStatus::Cancelled);
    assert_eq!(runs[1].status(), ExecutionStatus::Succeeded);
    assert_eq!(
        runs[0].cancel_reason.as_deref(),
        Some(format!("superseded by run {}", runs[1].id).as_str())
    );
}
