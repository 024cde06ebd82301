//! Test: Release - dry-run gate and credential binding

use crate::helpers::*;
use shipyard::core::{ExecutionStatus, RepositoryEvent};
use shipyard::execution::ExecutionEvent;
use shipyard::persistence::PersistenceBackend;
use shipyard::secrets::MemorySecretStore;

const TOKEN: &str = "cio-4f1b9c2d7e";

fn tag_push() -> RepositoryEvent {
    RepositoryEvent::push("refs/tags/v1.2.3")
}

fn registry_token() -> MemorySecretStore {
    MemorySecretStore::new().with_secret("CARGO_REGISTRY_TOKEN", TOKEN)
}

/// A failed dry run skips publish before its credential is ever read
#[tokio::test]
async fn test_failed_dry_run_skips_publish_without_secret_lookup() {
    let actions = MockActions::new().fail_when("--dry-run", 101);
    let secrets = CountingSecrets::new(registry_token());
    let dispatcher = dispatcher(actions.clone(), secrets.clone());

    let runs = dispatch_and_wait(&dispatcher, &tag_push()).await;

    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.pipeline.name, "Release");
    assert_eq!(run.group, None);

    assert_eq!(job_status(run, "dry-run"), ExecutionStatus::Failed);
    assert_eq!(job_status(run, "publish"), ExecutionStatus::Skipped);
    assert!(step_statuses(run, "publish")
        .iter()
        .all(|status| *status == ExecutionStatus::Skipped));
    assert_eq!(
        run.job("publish").unwrap().reason.as_deref(),
        Some("needs 'dry-run' which failed")
    );

    assert_eq!(secrets.lookups(), 0);
    assert_eq!(actions.count_matching("cargo publish"), 1);
    assert_eq!(run.status(), ExecutionStatus::Failed);
}

/// The token reaches the publish step and nothing else sees it
#[tokio::test]
async fn test_publish_receives_token_and_output_is_masked() {
    let actions = MockActions::new().echo_env();
    let secrets = CountingSecrets::new(registry_token());
    let store = archive();
    let dispatcher = dispatcher(actions.clone(), secrets.clone()).with_store(store.clone());
    let events = record_events(&dispatcher);

    let runs = dispatch_and_wait(&dispatcher, &tag_push()).await;
    let run = &runs[0];

    assert_eq!(run.status(), ExecutionStatus::Succeeded);
    assert_eq!(job_status(run, "dry-run"), ExecutionStatus::Succeeded);
    assert_eq!(job_status(run, "publish"), ExecutionStatus::Succeeded);
    assert_eq!(secrets.lookups(), 1);

    // Only the step that references the secret gets it
    let with_token: Vec<_> = actions
        .invocations()
        .into_iter()
        .filter(|invocation| {
            invocation
                .env
                .iter()
                .any(|(key, value)| key == "CARGO_REGISTRY_TOKEN" && value == TOKEN)
        })
        .collect();
    assert_eq!(with_token.len(), 1);
    assert_eq!(with_token[0].step_id, "publish");

    let events = events.lock().unwrap();
    let publish_output = events
        .iter()
        .find_map(|event| match event {
            ExecutionEvent::StepOutput { step_id, output, .. } if step_id == "publish" => {
                Some(output.clone())
            }
            _ => None,
        })
        .expect("publish step produced output");
    assert!(publish_output.contains("CARGO_REGISTRY_TOKEN=***"));
    let streamed: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::StepOutputLine { step_id, line, .. } if step_id == "publish" => {
                Some(line.as_str())
            }
            _ => None,
        })
        .collect();
    assert!(streamed.contains(&"CARGO_REGISTRY_TOKEN=***"));
    assert!(events
        .iter()
        .all(|event| !format!("{:?}", event).contains(TOKEN)));

    let summary = store.load_run(run.id).await.unwrap().expect("run is archived");
    let archived = serde_json::to_string(&summary).unwrap();
    assert!(!archived.contains(TOKEN));
    assert!(!format!("{:?}", run).contains(TOKEN));
}

/// A missing credential fails the step that needs it
#[tokio::test]
async fn test_missing_secret_fails_publish() {
    let actions = MockActions::new();
    let secrets = CountingSecrets::new(MemorySecretStore::new());
    let dispatcher = dispatcher(actions.clone(), secrets.clone());

    let runs = dispatch_and_wait(&dispatcher, &tag_push()).await;
    let run = &runs[0];

    assert_eq!(job_status(run, "dry-run"), ExecutionStatus::Succeeded);
    assert_eq!(job_status(run, "publish"), ExecutionStatus::Failed);
    let publish = run.job("publish").unwrap();
    let failed_step = publish.steps.last().unwrap();
    assert_eq!(failed_step.id, "publish");
    assert_eq!(failed_step.status(), ExecutionStatus::Failed);
    let error = failed_step.error.clone().unwrap();
    assert!(error.contains("secret 'CARGO_REGISTRY_TOKEN' is not available"), "error: {}", error);

    // The real publish never ran
    assert_eq!(actions.count_matching("cargo publish"), 1);
    assert_eq!(secrets.lookups(), 1);
    assert_eq!(run.status(), ExecutionStatus::Failed);
}
