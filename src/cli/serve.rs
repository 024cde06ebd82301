//! Long-lived dispatch session
//!
//! Requests arrive as JSON, one per line. They all go through one
//! [`Dispatcher`], so concurrency groups hold across events: a second update
//! to a pull request supersedes the run started for the first.
//!
//! ```text
//! {"type": "push", "ref": "refs/tags/v0.4.0"}
//! {"type": "pull_request", "number": 7, "base": "main", "head": "fix-lexer"}
//! {"type": "status", "group": "CI-fix-lexer"}
//! {"type": "cancel", "group": "CI-fix-lexer"}
//! ```

use crate::action::ActionExecutor;
use crate::core::{RepositoryEvent, Run};
use crate::execution::{Dispatcher, RunHandle};
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// One request line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServeRequest {
    Push {
        #[serde(rename = "ref")]
        git_ref: String,
    },
    PullRequest {
        number: u64,
        base: String,
        head: String,
    },
    /// Cancel the run holding a concurrency group
    Cancel {
        group: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Report the run holding a concurrency group
    Status { group: String },
}

impl ServeRequest {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).with_context(|| format!("invalid request: {}", line))
    }
}

/// Feed every request from `input` to `dispatcher` until end of input
///
/// Each request gets one `reply` line. Once the input is exhausted, waits
/// for every run that was started and returns them in dispatch order.
pub async fn serve<A, R>(dispatcher: &Dispatcher<A>, input: R, reply: impl Fn(&str)) -> Result<Vec<Run>>
where
    A: ActionExecutor + 'static,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut handles: Vec<RunHandle> = Vec::new();

    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request = match ServeRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("{:#}", e);
                reply(&format!("error: {:#}", e));
                continue;
            }
        };
        debug!("Request: {:?}", request);

        match request {
            ServeRequest::Push { git_ref } => {
                dispatch(dispatcher, &RepositoryEvent::push(&git_ref), &mut handles, &reply)
            }
            ServeRequest::PullRequest { number, base, head } => dispatch(
                dispatcher,
                &RepositoryEvent::pull_request(number, &base, &head),
                &mut handles,
                &reply,
            ),
            ServeRequest::Cancel { group, reason } => {
                let reason = reason.unwrap_or_else(|| "cancelled by request".to_string());
                match dispatcher.governor().cancel_group(&group, &reason) {
                    Some(run_id) => reply(&format!("cancel {}: run {}", group, run_id)),
                    None => reply(&format!("cancel {}: no run in progress", group)),
                }
            }
            ServeRequest::Status { group } => match dispatcher.governor().holder(&group) {
                Some(run_id) => reply(&format!("status {}: run {}", group, run_id)),
                None => reply(&format!("status {}: idle", group)),
            },
        }
    }

    let mut runs = Vec::with_capacity(handles.len());
    for handle in handles {
        runs.push(handle.wait().await?);
    }
    Ok(runs)
}

fn dispatch<A: ActionExecutor + 'static>(
    dispatcher: &Dispatcher<A>,
    event: &RepositoryEvent,
    handles: &mut Vec<RunHandle>,
    reply: &impl Fn(&str),
) {
    let started = match dispatcher.dispatch(event) {
        Ok(started) => started,
        Err(e) => {
            warn!("Cannot dispatch {}: {}", event, e);
            reply(&format!("error: {}", e));
            return;
        }
    };

    if started.is_empty() {
        reply(&format!("{}: no pipeline matches", event));
    }
    for handle in &started {
        match &handle.group {
            Some(group) => reply(&format!(
                "{}: {} run {} in group {}",
                event, handle.pipeline_name, handle.run_id, group
            )),
            None => reply(&format!("{}: {} run {}", event, handle.pipeline_name, handle.run_id)),
        }
    }
    handles.extend(started);
}
