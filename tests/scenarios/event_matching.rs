//! Test: Event matching against the shipped workflows

use crate::helpers::*;
use shipyard::core::RepositoryEvent;
use shipyard::secrets::MemorySecretStore;
use std::sync::Arc;

fn matching_names(event: &RepositoryEvent) -> Vec<String> {
    let mut names: Vec<String> = shipped_registry()
        .matching(event)
        .iter()
        .map(|pipeline| pipeline.name.clone())
        .collect();
    names.sort();
    names
}

#[test]
fn test_shipped_registry_loads_both_workflows() {
    let registry = shipped_registry();
    assert_eq!(registry.len(), 2);
    assert!(registry.get("CI").is_some());
    assert!(registry.get("Release").is_some());
}

#[test]
fn test_version_tag_triggers_release_only() {
    assert_eq!(matching_names(&RepositoryEvent::push("refs/tags/v1.2.3")), vec!["Release"]);
    assert!(matching_names(&RepositoryEvent::push("refs/tags/nightly")).is_empty());
}

#[test]
fn test_main_and_pull_requests_trigger_ci() {
    assert_eq!(matching_names(&RepositoryEvent::push("refs/heads/main")), vec!["CI"]);
    assert_eq!(matching_names(&pull_request(5, "fix-lexer")), vec!["CI"]);
    // Pull requests match on their base branch
    assert!(matching_names(&RepositoryEvent::pull_request(6, "legacy", "main")).is_empty());
}

#[tokio::test]
async fn test_feature_branch_push_creates_no_runs() {
    let dispatcher = dispatcher(MockActions::new(), Arc::new(MemorySecretStore::new()));
    let handles = dispatcher
        .dispatch(&RepositoryEvent::push("refs/heads/feature/cache"))
        .unwrap();
    assert!(handles.is_empty());
}
