//! Job scheduler - determines which jobs to start next

use crate::core::{ExecutionStatus, Run};

/// Strategy for scheduling job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute jobs in dependency order, one at a time
    Sequential,

    /// Execute all ready jobs in parallel
    #[default]
    Parallel,

    /// Limited parallelism (max N concurrent jobs)
    LimitedParallel(usize),
}

impl SchedulingStrategy {
    /// Parse `sequential`, `parallel` or a job limit
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            n => n
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .map(Self::LimitedParallel),
        }
    }

    fn capacity(self, running: usize) -> usize {
        match self {
            SchedulingStrategy::Sequential => 1usize.saturating_sub(running),
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => max.saturating_sub(running),
        }
    }
}

/// Decisions for the pending jobs of a run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SchedulePlan {
    /// Jobs whose dependencies all succeeded, in execution order
    pub ready: Vec<String>,

    /// Jobs that can never run, with the reason
    pub skip: Vec<(String, String)>,
}

impl SchedulePlan {
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.skip.is_empty()
    }
}

/// Scheduler for determining which jobs to run
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Plan the next batch for a run with `running` jobs in flight
    ///
    /// A pending job is ready once every job it needs has succeeded. It is
    /// skipped as soon as one of them ends in any other terminal state.
    pub fn plan(&self, run: &Run, running: usize) -> SchedulePlan {
        let succeeded = run.succeeded_jobs();
        let mut plan = SchedulePlan::default();

        for job_id in run.pipeline.execution_order() {
            let (Some(job), Some(record)) = (run.pipeline.job(job_id), run.job(job_id)) else {
                continue;
            };
            if record.status() != ExecutionStatus::Pending {
                continue;
            }

            let blocker = job.needs.iter().find_map(|dependency| {
                let status = run.job(dependency)?.status();
                (status.is_terminal() && status != ExecutionStatus::Succeeded)
                    .then(|| (dependency, status))
            });

            if let Some((dependency, status)) = blocker {
                plan.skip.push((
                    job_id.clone(),
                    format!("needs '{}' which {}", dependency, describe(status)),
                ));
            } else if job.dependencies_satisfied(&succeeded) {
                plan.ready.push(job_id.clone());
            }
        }

        plan.ready.truncate(self.strategy.capacity(running));
        plan
    }
}

fn describe(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Skipped => "was skipped",
        ExecutionStatus::Cancelled => "was cancelled",
        _ => "did not succeed",
    }
}
