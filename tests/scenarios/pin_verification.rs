//! Test: Action pins - unpinned or mismatched references fail without retry

use crate::helpers::*;
use shipyard::core::config::WorkflowConfig;
use shipyard::core::{ExecutionStatus, PipelineRegistry};
use shipyard::execution::{Dispatcher, ExecutionEngine, SchedulingStrategy};
use shipyard::secrets::MemorySecretStore;
use std::sync::Arc;

const DRIFTED: &str = r#"
name: Drifted
on:
  push:
    branches: [main]
jobs:
  build:
    steps:
      - run: echo ready
      - id: checkout
        uses: actions/checkout@v4
      - run: cargo build
  lint:
    steps:
      - uses: someone/unvetted-linter@v1
  deploy:
    needs: [build]
    steps:
      - run: ./deploy.sh
"#;

fn drifted_dispatcher(actions: MockActions) -> Dispatcher<MockActions> {
    let pipeline = WorkflowConfig::from_yaml(DRIFTED)
        .unwrap()
        .to_pipeline()
        .unwrap();
    let engine = ExecutionEngine::new(
        actions,
        shipped_catalog(),
        Arc::new(MemorySecretStore::new()),
        SchedulingStrategy::Parallel,
    );
    Dispatcher::new(PipelineRegistry::new([pipeline]), engine)
}

#[tokio::test]
async fn test_pin_mismatch_fails_job_once() {
    let actions = MockActions::new();
    let dispatcher = drifted_dispatcher(actions.clone());

    let runs = dispatch_and_wait(&dispatcher, &shipyard::core::RepositoryEvent::push("main")).await;
    let run = &runs[0];

    assert_eq!(job_status(run, "build"), ExecutionStatus::Failed);
    assert_eq!(
        step_statuses(run, "build"),
        vec![
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ]
    );
    let checkout = &run.job("build").unwrap().steps[1];
    let error = checkout.error.clone().unwrap();
    assert!(error.starts_with("configuration error"), "error: {}", error);
    assert!(error.contains("actions/checkout"), "error: {}", error);
    assert!(error.contains("lock file"), "error: {}", error);

    // Dependents of the failed job never start
    assert_eq!(job_status(run, "deploy"), ExecutionStatus::Skipped);
    assert_eq!(run.status(), ExecutionStatus::Failed);

    // Only `echo ready` reached the action layer: no retries, no deploy
    let scripts = actions.scripts();
    assert_eq!(scripts, vec!["echo ready".to_string()]);
}

#[tokio::test]
async fn test_unknown_action_fails_job() {
    let dispatcher = drifted_dispatcher(MockActions::new());

    let runs = dispatch_and_wait(&dispatcher, &shipyard::core::RepositoryEvent::push("main")).await;
    let lint = runs[0].job("lint").unwrap();

    assert_eq!(lint.status(), ExecutionStatus::Failed);
    let error = lint.steps[0].error.clone().unwrap();
    assert!(error.contains("someone/unvetted-linter"), "error: {}", error);
}

#[test]
fn test_shipped_workflows_are_fully_pinned() {
    let catalog = shipped_catalog();
    for pipeline in shipped_registry().pipelines() {
        for job in pipeline.jobs.values() {
            for step in &job.steps {
                if let shipyard::core::StepKind::Uses(action) = &step.kind {
                    assert!(
                        catalog.resolve(action).is_ok(),
                        "{} / {} / {} is not in the lock file",
                        pipeline.name,
                        job.id,
                        step.id
                    );
                }
            }
        }
    }
}
