//! Scenario-based tests for shipyard

mod ci_pull_request;
mod event_matching;
mod pin_verification;
mod release_publish;
mod superseded_runs;
