//! Persistence layer for run history
//!
//! Only the final, masked state of a run is archived. Rendered inputs and
//! environments are never part of a summary.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

pub use crate::core::ExecutionStatus;
use crate::core::{JobRecord, Run};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a finished (or cancelled) run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique run ID
    pub run_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    /// `push` or `pull_request`
    pub event: String,

    /// Full git ref of the triggering event
    pub git_ref: String,

    /// Concurrency group key, if any
    pub group: Option<String>,

    /// Run status
    pub status: ExecutionStatus,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When execution started (never, for runs cancelled while queued)
    pub started_at: Option<DateTime<Utc>>,

    /// When execution completed (if complete)
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    pub succeeded_jobs: usize,
    pub failed_jobs: usize,
    pub skipped_jobs: usize,
    pub cancelled_jobs: usize,

    /// Total number of jobs
    pub total_jobs: usize,

    pub cancel_reason: Option<String>,

    /// Per-job records
    pub jobs: Vec<JobRecord>,
}

impl ExecutionSummary {
    pub fn short_id(&self) -> String {
        self.run_id.to_string()[..8].to_string()
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run summary, replacing any earlier one for the same run
    async fn save_run(&self, summary: &ExecutionSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<ExecutionSummary>>;

    /// List runs of a pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str, limit: usize) -> Result<Vec<ExecutionSummary>>;

    /// Newest run of a pipeline
    async fn latest_run(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>> {
        Ok(self.list_runs(pipeline_name, 1).await?.into_iter().next())
    }

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, ExecutionSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, summary: &ExecutionSummary) -> Result<()> {
        let mut runs = self.runs.write().await;
        runs.insert(summary.run_id, summary.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<ExecutionSummary> = runs
            .values()
            .filter(|run| run.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|run| run.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Create a summary from a run
pub fn create_summary(run: &Run) -> ExecutionSummary {
    let state = &run.state;
    ExecutionSummary {
        run_id: run.id,
        pipeline_name: run.pipeline.name.clone(),
        event: run.event.event_name().to_string(),
        git_ref: run.event.git_ref(),
        group: run.group.clone(),
        status: run.status(),
        created_at: run.created_at,
        started_at: state.lifecycle.started_at,
        completed_at: state.lifecycle.finished_at,
        progress: state.progress(),
        succeeded_jobs: state.succeeded_jobs,
        failed_jobs: state.failed_jobs,
        skipped_jobs: state.skipped_jobs,
        cancelled_jobs: state.cancelled_jobs,
        total_jobs: state.total_jobs,
        cancel_reason: run.cancel_reason.clone(),
        jobs: run.jobs.values().cloned().collect(),
    }
}
