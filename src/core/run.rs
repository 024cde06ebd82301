//! Run: one instantiation of a pipeline for one event

use crate::core::{
    config::ConfigurationError,
    context::PipelineContext,
    pipeline::Pipeline,
    state::{ExecutionStatus, JobRecord, RunState, StateError},
    trigger::RepositoryEvent,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Per-run mutable state over an immutable pipeline definition
#[derive(Debug, Clone)]
pub struct Run {
    /// Unique run ID
    pub id: Uuid,

    pub pipeline: Arc<Pipeline>,

    /// Triggering event
    pub event: RepositoryEvent,

    /// Concurrency group key, if the pipeline is grouped
    pub group: Option<String>,

    pub state: RunState,

    /// Job records keyed by job id
    pub jobs: BTreeMap<String, JobRecord>,

    pub created_at: DateTime<Utc>,

    /// Why the run was cancelled, if it was
    pub cancel_reason: Option<String>,
}

impl Run {
    pub fn new(pipeline: Arc<Pipeline>, event: RepositoryEvent) -> Result<Self, ConfigurationError> {
        let id = Uuid::new_v4();
        let group = pipeline.group_key(&event, &id.to_string())?;
        let jobs: BTreeMap<String, JobRecord> = pipeline
            .jobs
            .values()
            .map(|job| (job.id.clone(), job.new_record()))
            .collect();

        Ok(Self {
            id,
            state: RunState::new(jobs.len()),
            pipeline,
            event,
            group,
            jobs,
            created_at: Utc::now(),
            cancel_reason: None,
        })
    }

    /// Short form of the run id for display
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.status()
    }

    pub fn job(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn job_mut(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.jobs.get_mut(id)
    }

    /// Ids of jobs that reached `succeeded`
    pub fn succeeded_jobs(&self) -> HashSet<String> {
        self.jobs
            .values()
            .filter(|job| job.status() == ExecutionStatus::Succeeded)
            .map(|job| job.id.clone())
            .collect()
    }

    /// Check if every job is in a terminal state
    pub fn is_complete(&self) -> bool {
        self.jobs.values().all(|job| job.lifecycle.is_terminal())
    }

    /// Base context for the jobs of this run
    pub fn context(&self) -> PipelineContext {
        self.pipeline.context_for_run(&self.event, &self.id.to_string())
    }

    pub fn start(&mut self) -> Result<(), StateError> {
        let subject = format!("run {}", self.short_id());
        self.state.lifecycle.transition(&subject, ExecutionStatus::Running)
    }

    /// Move the run to its terminal status
    pub fn finish(&mut self, status: ExecutionStatus) -> Result<(), StateError> {
        self.state.update_counts(self.jobs.values());
        let subject = format!("run {}", self.short_id());
        self.state.lifecycle.transition(&subject, status)
    }

    /// Terminal status derived from the job records
    ///
    /// A cancelled run stays cancelled; otherwise any failed or skipped job
    /// fails the run.
    pub fn outcome(&self, cancelled: bool) -> ExecutionStatus {
        if cancelled {
            return ExecutionStatus::Cancelled;
        }
        let any_unsuccessful = self.jobs.values().any(|job| {
            matches!(
                job.status(),
                ExecutionStatus::Failed | ExecutionStatus::Skipped | ExecutionStatus::Cancelled
            )
        });
        if any_unsuccessful {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Succeeded
        }
    }
}
