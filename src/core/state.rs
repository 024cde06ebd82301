//! Execution state models
//!
//! Runs, jobs and steps share one lifecycle:
//! `pending -> running -> {succeeded, failed, skipped, cancelled}`.
//! `skipped` is only reachable from `pending`, `cancelled` from `pending` or
//! `running`, and every right-hand state is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Status of a run, job or step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Not started yet
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Succeeded,
    /// Finished with an error
    Failed,
    /// Never executed because a dependency did not succeed
    Skipped,
    /// Stopped by a cancellation signal
    Cancelled,
}

impl ExecutionStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Process exit code equivalent of a terminal status
    ///
    /// Cancelled and skipped get their own codes so that observers can tell
    /// them apart from failures.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ExecutionStatus::Succeeded => Some(0),
            ExecutionStatus::Failed => Some(1),
            ExecutionStatus::Skipped => Some(78),
            ExecutionStatus::Cancelled => Some(130),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the lowercase name produced by [`ExecutionStatus::as_str`]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "succeeded" => Some(ExecutionStatus::Succeeded),
            "failed" => Some(ExecutionStatus::Failed),
            "skipped" => Some(ExecutionStatus::Skipped),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for {subject}: {from} -> {to}")]
pub struct StateError {
    pub subject: String,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// Status plus the timestamps of its transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `to`, recording timestamps
    pub fn transition(&mut self, subject: &str, to: ExecutionStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError {
                subject: subject.to_string(),
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        if to == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one step within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identifier within its job
    pub id: String,

    /// Display name
    pub name: String,

    pub lifecycle: Lifecycle,

    /// Outputs emitted by the step
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Exit code of the underlying command, if one ran
    pub exit_code: Option<i32>,

    /// Error or reason for a non-successful outcome (secrets masked)
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            lifecycle: Lifecycle::new(),
            outputs: BTreeMap::new(),
            exit_code: None,
            error: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.lifecycle.status
    }
}

/// Outcome of one job within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub lifecycle: Lifecycle,
    pub steps: Vec<StepRecord>,

    /// Why the job was skipped, cancelled or failed
    pub reason: Option<String>,
}

impl JobRecord {
    pub fn new(id: &str, steps: Vec<StepRecord>) -> Self {
        Self {
            id: id.to_string(),
            lifecycle: Lifecycle::new(),
            steps,
            reason: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.lifecycle.status
    }

    /// Transition the job, naming it in the error
    pub fn transition(&mut self, to: ExecutionStatus) -> Result<(), StateError> {
        let subject = format!("job '{}'", self.id);
        self.lifecycle.transition(&subject, to)
    }

    /// Mark every still-pending step with `to` (skipped or cancelled)
    pub fn settle_pending_steps(&mut self, to: ExecutionStatus) {
        for step in &mut self.steps {
            if step.status() == ExecutionStatus::Pending {
                // pending -> skipped/cancelled is always allowed
                let _ = step.lifecycle.transition(&step.id, to);
            }
        }
    }
}

/// Aggregate state of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub lifecycle: Lifecycle,

    /// Total number of jobs
    pub total_jobs: usize,

    pub succeeded_jobs: usize,
    pub failed_jobs: usize,
    pub skipped_jobs: usize,
    pub cancelled_jobs: usize,
    pub running_jobs: usize,
}

impl RunState {
    pub fn new(total_jobs: usize) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            total_jobs,
            succeeded_jobs: 0,
            failed_jobs: 0,
            skipped_jobs: 0,
            cancelled_jobs: 0,
            running_jobs: 0,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.lifecycle.status
    }

    /// Update job counts from the job records
    pub fn update_counts<'a>(&mut self, jobs: impl IntoIterator<Item = &'a JobRecord>) {
        self.succeeded_jobs = 0;
        self.failed_jobs = 0;
        self.skipped_jobs = 0;
        self.cancelled_jobs = 0;
        self.running_jobs = 0;

        for job in jobs {
            match job.status() {
                ExecutionStatus::Succeeded => self.succeeded_jobs += 1,
                ExecutionStatus::Failed => self.failed_jobs += 1,
                ExecutionStatus::Skipped => self.skipped_jobs += 1,
                ExecutionStatus::Cancelled => self.cancelled_jobs += 1,
                ExecutionStatus::Running => self.running_jobs += 1,
                ExecutionStatus::Pending => {}
            }
        }
    }

    /// Number of jobs in a terminal state
    pub fn finished_jobs(&self) -> usize {
        self.succeeded_jobs + self.failed_jobs + self.skipped_jobs + self.cancelled_jobs
    }

    /// Calculate progress percentage (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        self.finished_jobs() as f64 / self.total_jobs as f64
    }
}
