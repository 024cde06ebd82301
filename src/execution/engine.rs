//! Main execution engine - orchestrates the jobs of a run

use crate::{
    action::{ActionCatalog, ActionExecutor},
    core::{ExecutionStatus, JobRecord, Run},
    execution::{CancelToken, ExecutionScheduler, SchedulingStrategy, StepExecutor},
    secrets::{SecretMask, SecretStore},
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Events that can occur during run execution
///
/// Errors and output carried by events are masked.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunQueued {
        run_id: Uuid,
        pipeline_name: String,
        group: Option<String>,
    },
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        git_ref: String,
    },
    RunCancelled {
        run_id: Uuid,
        reason: String,
    },
    RunFinished {
        run_id: Uuid,
        pipeline_name: String,
        status: ExecutionStatus,
    },
    JobStarted {
        run_id: Uuid,
        job_id: String,
    },
    JobSkipped {
        run_id: Uuid,
        job_id: String,
        reason: String,
    },
    JobFinished {
        run_id: Uuid,
        job_id: String,
        status: ExecutionStatus,
        reason: Option<String>,
    },
    StepStarted {
        run_id: Uuid,
        job_id: String,
        step_id: String,
        name: String,
    },
    /// One line of step output, as the action produced it
    StepOutputLine {
        run_id: Uuid,
        job_id: String,
        step_id: String,
        line: String,
    },
    /// Full output of a finished step
    StepOutput {
        run_id: Uuid,
        job_id: String,
        step_id: String,
        output: String,
    },
    StepFinished {
        run_id: Uuid,
        job_id: String,
        step_id: String,
        status: ExecutionStatus,
        error: Option<String>,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

/// Main run execution engine
pub struct ExecutionEngine<A> {
    scheduler: ExecutionScheduler,
    executor: Arc<StepExecutor<A>>,
    events: EventBus,
}

impl<A: ActionExecutor + 'static> ExecutionEngine<A> {
    pub fn new(
        actions: A,
        catalog: ActionCatalog,
        secrets: Arc<dyn SecretStore>,
        strategy: SchedulingStrategy,
    ) -> Self {
        Self {
            scheduler: ExecutionScheduler::new(strategy),
            executor: Arc::new(StepExecutor::new(actions, catalog, secrets)),
            events: EventBus::default(),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Execute every job of a run until it reaches a terminal status
    ///
    /// Jobs run as their dependencies succeed. Cancellation stops pending
    /// jobs from starting and interrupts running steps.
    pub async fn execute(&self, run: &mut Run, cancel: &CancelToken) -> ExecutionStatus {
        let pipeline = run.pipeline.clone();
        info!(
            "Starting run {} of {} for {}",
            run.short_id(),
            pipeline.name,
            run.event
        );
        if let Err(e) = run.start() {
            error!("{}", e);
            return run.status();
        }
        self.events.emit(ExecutionEvent::RunStarted {
            run_id: run.id,
            pipeline_name: pipeline.name.clone(),
            git_ref: run.event.git_ref(),
        });

        let run_id = run.id;
        let mask = Arc::new(SecretMask::new());
        let context = run.context();
        let mut tasks: JoinSet<JobRecord> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut cancel_seen = false;

        loop {
            if cancel.is_cancelled() {
                if !cancel_seen {
                    cancel_seen = true;
                    let reason = cancel.reason().unwrap_or_default();
                    warn!("Run {} cancelled: {}", run.short_id(), reason);
                    self.events.emit(ExecutionEvent::RunCancelled {
                        run_id: run.id,
                        reason,
                    });
                }
                self.cancel_pending_jobs(run, cancel);
            } else {
                let plan = self.scheduler.plan(run, in_flight.len());

                if !plan.skip.is_empty() {
                    for (job_id, reason) in plan.skip {
                        self.skip_job(run, &job_id, reason);
                    }
                    // Skips can unblock further skips
                    continue;
                }

                for job_id in plan.ready {
                    let (Some(job), Some(record)) = (pipeline.job(&job_id), run.job_mut(&job_id))
                    else {
                        continue;
                    };
                    if let Err(e) = record.transition(ExecutionStatus::Running) {
                        error!("{}", e);
                        continue;
                    }
                    info!("Starting job {}", job_id);
                    self.events.emit(ExecutionEvent::JobStarted {
                        run_id,
                        job_id: job_id.clone(),
                    });

                    let job = job.clone();
                    let record = record.clone();
                    let executor = self.executor.clone();
                    let context = context.clone();
                    let cancel = cancel.clone();
                    let mask = mask.clone();
                    let events = self.events.clone();

                    let handle = tasks.spawn(async move {
                        executor
                            .run_job(run_id, &job, record, context, &cancel, &mask, &events)
                            .await
                    });
                    in_flight.insert(handle.id(), job_id);
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            match joined {
                Ok((task_id, record)) => {
                    in_flight.remove(&task_id);
                    self.events.emit(ExecutionEvent::JobFinished {
                        run_id: run.id,
                        job_id: record.id.clone(),
                        status: record.status(),
                        reason: record.reason.clone(),
                    });
                    run.jobs.insert(record.id.clone(), record);
                }
                Err(e) => {
                    let job_id = in_flight.remove(&e.id());
                    error!("Job task {:?} failed: {}", job_id, e);
                    if let Some(record) = job_id.as_deref().and_then(|id| run.job_mut(id)) {
                        record.reason = Some(format!("job task failed: {}", e));
                        record.settle_pending_steps(ExecutionStatus::Skipped);
                        if let Err(e) = record.transition(ExecutionStatus::Failed) {
                            error!("{}", e);
                        }
                        self.events.emit(ExecutionEvent::JobFinished {
                            run_id,
                            job_id: record.id.clone(),
                            status: record.status(),
                            reason: record.reason.clone(),
                        });
                    }
                }
            }
            run.state.update_counts(run.jobs.values());
        }

        // Anything still pending is behind a cycle the config check missed
        let stranded: Vec<String> = run
            .jobs
            .values()
            .filter(|job| job.status() == ExecutionStatus::Pending)
            .map(|job| job.id.clone())
            .collect();
        for job_id in stranded {
            self.skip_job(run, &job_id, "dependencies can never be satisfied".to_string());
        }

        let cancelled = run
            .jobs
            .values()
            .any(|job| job.status() == ExecutionStatus::Cancelled);
        if cancelled {
            run.cancel_reason = cancel.reason();
        }
        let status = run.outcome(cancelled);
        self.finish(run, status)
    }

    /// Settle a run that was cancelled before it was ever admitted
    pub fn cancel_queued(&self, run: &mut Run, cancel: &CancelToken) -> ExecutionStatus {
        let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        info!("Run {} cancelled before start: {}", run.short_id(), reason);
        self.events.emit(ExecutionEvent::RunCancelled {
            run_id: run.id,
            reason: reason.clone(),
        });
        self.cancel_pending_jobs(run, cancel);
        run.cancel_reason = Some(reason);
        self.finish(run, ExecutionStatus::Cancelled)
    }

    fn finish(&self, run: &mut Run, status: ExecutionStatus) -> ExecutionStatus {
        if let Err(e) = run.finish(status) {
            error!("{}", e);
        }
        info!("Run {} finished: {}", run.short_id(), status);
        self.events.emit(ExecutionEvent::RunFinished {
            run_id: run.id,
            pipeline_name: run.pipeline.name.clone(),
            status,
        });
        status
    }

    fn skip_job(&self, run: &mut Run, job_id: &str, reason: String) {
        let run_id = run.id;
        let Some(record) = run.job_mut(job_id) else {
            return;
        };
        if let Err(e) = record.transition(ExecutionStatus::Skipped) {
            error!("{}", e);
            return;
        }
        record.settle_pending_steps(ExecutionStatus::Skipped);
        record.reason = Some(reason.clone());
        info!("Skipping job {}: {}", job_id, reason);
        self.events.emit(ExecutionEvent::JobSkipped {
            run_id,
            job_id: job_id.to_string(),
            reason,
        });
    }

    fn cancel_pending_jobs(&self, run: &mut Run, cancel: &CancelToken) {
        let run_id = run.id;
        for record in run.jobs.values_mut() {
            if record.status() != ExecutionStatus::Pending {
                continue;
            }
            if let Err(e) = record.transition(ExecutionStatus::Cancelled) {
                error!("{}", e);
                continue;
            }
            record.settle_pending_steps(ExecutionStatus::Cancelled);
            record.reason = cancel.reason();
            self.events.emit(ExecutionEvent::JobFinished {
                run_id,
                job_id: record.id.clone(),
                status: ExecutionStatus::Cancelled,
                reason: record.reason.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionError, ActionInvocation, ActionOutcome};
    use crate::core::{config::WorkflowConfig, RepositoryEvent};
    use crate::secrets::MemorySecretStore;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fails every step whose id is in `failing`
    struct FailingSteps {
        failing: HashSet<String>,
    }

    #[async_trait]
    impl ActionExecutor for FailingSteps {
        async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutcome, ActionError> {
            if self.failing.contains(&invocation.step_id) {
                Ok(ActionOutcome::failure(1, "boom"))
            } else {
                Ok(ActionOutcome::success())
            }
        }
    }

    const WORKFLOW: &str = r#"
name: Build
on:
  push:
    branches: [main]
jobs:
  build:
    steps:
      - id: compile
        run: make
  test:
    needs: [build]
    steps:
      - id: unit
        run: make test
  lint:
    steps:
      - id: clippy
        run: make lint
  dist:
    needs: [test, lint]
    steps:
      - id: package
        run: make dist
"#;

    fn engine(failing: &[&str]) -> ExecutionEngine<FailingSteps> {
        ExecutionEngine::new(
            FailingSteps {
                failing: failing.iter().map(|s| s.to_string()).collect(),
            },
            ActionCatalog::builtin(),
            Arc::new(MemorySecretStore::new()),
            SchedulingStrategy::Parallel,
        )
    }

    fn run() -> Run {
        let pipeline = WorkflowConfig::from_yaml(WORKFLOW)
            .unwrap()
            .to_pipeline()
            .unwrap();
        Run::new(Arc::new(pipeline), RepositoryEvent::push("refs/heads/main")).unwrap()
    }

    struct PanickingActions;

    #[async_trait]
    impl ActionExecutor for PanickingActions {
        async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutcome, ActionError> {
            if invocation.step_id == "clippy" {
                panic!("lint runner crashed");
            }
            Ok(ActionOutcome::success())
        }
    }

    #[tokio::test]
    async fn test_panicking_job_is_failed_and_reported() {
        let engine = ExecutionEngine::new(
            PanickingActions,
            ActionCatalog::builtin(),
            Arc::new(MemorySecretStore::new()),
            SchedulingStrategy::Parallel,
        );
        let finished = Arc::new(Mutex::new(Vec::new()));
        let sink = finished.clone();
        engine.add_event_handler(move |event| {
            if let ExecutionEvent::JobFinished { job_id, status, .. } = event {
                sink.lock().unwrap().push((job_id, status));
            }
        });

        let mut run = run();
        let status = engine.execute(&mut run, &CancelToken::new()).await;

        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(run.job("lint").unwrap().status(), ExecutionStatus::Failed);
        assert_eq!(run.job("dist").unwrap().status(), ExecutionStatus::Skipped);
        assert!(finished
            .lock()
            .unwrap()
            .contains(&("lint".to_string(), ExecutionStatus::Failed)));
    }

    #[tokio::test]
    async fn test_all_jobs_succeed() {
        let engine = engine(&[]);
        let mut run = run();
        let status = engine.execute(&mut run, &CancelToken::new()).await;
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(run.status(), ExecutionStatus::Succeeded);
        assert_eq!(run.state.succeeded_jobs, 4);
        assert!(run.is_complete());
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let engine = engine(&["unit"]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

        let mut run = run();
        let status = engine.execute(&mut run, &CancelToken::new()).await;

        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(run.job("build").unwrap().status(), ExecutionStatus::Succeeded);
        assert_eq!(run.job("test").unwrap().status(), ExecutionStatus::Failed);
        assert_eq!(run.job("lint").unwrap().status(), ExecutionStatus::Succeeded);
        assert_eq!(run.job("dist").unwrap().status(), ExecutionStatus::Skipped);

        let events = events.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            ExecutionEvent::JobSkipped { job_id, .. } if job_id == "dist"
        )));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::RunFinished {
                status: ExecutionStatus::Failed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let engine = engine(&[]);
        let cancel = CancelToken::new();
        cancel.cancel("superseded");

        let mut run = run();
        let status = engine.execute(&mut run, &cancel).await;
        assert_eq!(status, ExecutionStatus::Cancelled);
        assert!(run
            .jobs
            .values()
            .all(|job| job.status() == ExecutionStatus::Cancelled));
        assert_eq!(run.cancel_reason.as_deref(), Some("superseded"));
    }

    #[tokio::test]
    async fn test_cancel_queued_run() {
        let engine = engine(&[]);
        let cancel = CancelToken::new();
        cancel.cancel("superseded by run x");
        let mut run = run();
        assert_eq!(engine.cancel_queued(&mut run, &cancel), ExecutionStatus::Cancelled);
        assert_eq!(run.status(), ExecutionStatus::Cancelled);
        assert!(run.state.lifecycle.started_at.is_none());
    }
}
