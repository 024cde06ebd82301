//! Test: CI on pull requests - independent jobs, fail-fast steps

use crate::helpers::*;
use shipyard::core::{ExecutionStatus, RepositoryEvent};
use shipyard::execution::ExecutionEvent;
use shipyard::persistence::PersistenceBackend;
use shipyard::secrets::MemorySecretStore;
use std::sync::Arc;

/// A clippy failure fails the run but leaves fmt and test alone
#[tokio::test]
async fn test_clippy_failure_does_not_stop_sibling_jobs() {
    let actions = MockActions::new().fail_when("cargo clippy", 101);
    let store = archive();
    let dispatcher = dispatcher(actions.clone(), Arc::new(MemorySecretStore::new())).with_store(store.clone());
    let events = record_events(&dispatcher);

    let runs = dispatch_and_wait(&dispatcher, &pull_request(12, "fix-lexer")).await;

    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.pipeline.name, "CI");
    assert_eq!(run.group.as_deref(), Some("CI-fix-lexer"));

    assert_eq!(job_status(run, "fmt"), ExecutionStatus::Succeeded);
    assert_eq!(job_status(run, "test"), ExecutionStatus::Succeeded);
    assert_eq!(job_status(run, "clippy"), ExecutionStatus::Failed);
    assert_eq!(
        step_statuses(run, "clippy"),
        vec![
            ExecutionStatus::Succeeded,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
        ]
    );

    let reason = run.job("clippy").unwrap().reason.clone().unwrap();
    assert!(reason.contains("step 'step-4' failed"), "reason: {}", reason);
    assert!(reason.contains("exited with code 101"), "reason: {}", reason);

    assert_eq!(run.status(), ExecutionStatus::Failed);
    assert_eq!(run.status().exit_code(), Some(1));

    // Each failing script ran exactly once
    assert_eq!(actions.count_matching("cargo clippy"), 1);

    let summary = store.load_run(run.id).await.unwrap().expect("run is archived");
    assert_eq!(summary.status, ExecutionStatus::Failed);
    assert_eq!(summary.failed_jobs, 1);
    assert_eq!(summary.succeeded_jobs, 2);
    assert_eq!(summary.event, "pull_request");

    let events = events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        ExecutionEvent::JobFinished { job_id, status: ExecutionStatus::Failed, .. } if job_id == "clippy"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        ExecutionEvent::RunFinished { status: ExecutionStatus::Failed, .. }
    )));
}

/// Catalog templates are rendered with each step's inputs
#[tokio::test]
async fn test_toolchain_components_follow_step_inputs() {
    let actions = MockActions::new();
    let dispatcher = dispatcher(actions.clone(), Arc::new(MemorySecretStore::new()));

    let runs = dispatch_and_wait(&dispatcher, &pull_request(3, "docs")).await;
    assert_eq!(runs[0].status(), ExecutionStatus::Succeeded);

    let scripts = actions.scripts();
    assert!(scripts.iter().any(|s| s.contains("--component rustfmt")));
    assert!(scripts.iter().any(|s| s.contains("--component clippy")));
    // The test job passes no components and gets the default
    assert!(scripts.iter().any(|s| s.contains("--component cargo")));
    assert!(scripts.iter().all(|s| !s.contains("${{")));

    let cache = actions
        .invocations()
        .into_iter()
        .find(|invocation| invocation.step_id == "cache")
        .expect("cache step was invoked");
    assert!(cache
        .inputs
        .contains(&("key".to_string(), "cargo-pull_request-docs".to_string())));
    assert!(cache
        .inputs
        .contains(&("lock-files".to_string(), "Cargo.lock".to_string())));

    let test_job = runs[0].job("test").unwrap();
    let cache_step = test_job.steps.iter().find(|step| step.id == "cache").unwrap();
    assert_eq!(cache_step.outputs.get("cache-hit").map(String::as_str), Some("false"));
}

/// Branch pushes have no head ref, so each run gets its own group
#[tokio::test]
async fn test_push_to_main_runs_ungrouped_by_branch() {
    let dispatcher = dispatcher(MockActions::new(), Arc::new(MemorySecretStore::new()));

    let first = dispatch_and_wait(&dispatcher, &RepositoryEvent::push("refs/heads/main")).await;
    let second = dispatch_and_wait(&dispatcher, &RepositoryEvent::push("main")).await;

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].status(), ExecutionStatus::Succeeded);
    assert_eq!(second[0].status(), ExecutionStatus::Succeeded);
    assert_eq!(first[0].group, Some(format!("CI-{}", first[0].id)));
    assert_ne!(first[0].group, second[0].group);
}

fn cache_key_input(actions: &MockActions) -> String {
    actions
        .invocations()
        .into_iter()
        .find(|invocation| invocation.step_id == "cache")
        .and_then(|invocation| {
            invocation
                .inputs
                .into_iter()
                .find(|(name, _)| name == "key")
                .map(|(_, value)| value)
        })
        .expect("cache step received a key")
}

/// Pull requests read and write their own cache scope, never trunk's
#[tokio::test]
async fn test_pull_request_cache_scope_is_separate_from_trunk() {
    let pr_actions = MockActions::new();
    let pr = dispatcher(pr_actions.clone(), Arc::new(MemorySecretStore::new()));
    dispatch_and_wait(&pr, &RepositoryEvent::pull_request(7, "main", "evil")).await;

    let push_actions = MockActions::new();
    let push = dispatcher(push_actions.clone(), Arc::new(MemorySecretStore::new()));
    dispatch_and_wait(&push, &RepositoryEvent::push("refs/heads/main")).await;

    assert_eq!(cache_key_input(&pr_actions), "cargo-pull_request-evil");
    assert_eq!(cache_key_input(&push_actions), "cargo-push-main");
}
