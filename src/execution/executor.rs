//! Step executor - runs the steps of one job with an action executor

use crate::{
    action::{ActionCatalog, ActionCommand, ActionExecutor, ActionImplementation, ActionInvocation},
    core::{
        config::ConfigurationError, ExecutionStatus, Job, JobRecord, Lifecycle, PipelineContext,
        Step, StepKind,
    },
    execution::{CancelToken, EventBus, ExecutionEvent},
    secrets::{BoundSecrets, SecretMask, SecretStore},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of executing a step
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Action reported success
    Success {
        outputs: BTreeMap<String, String>,
        log: String,
    },
    /// Configuration error, non-zero exit, action error or timeout
    Failed {
        error: String,
        exit_code: Option<i32>,
        log: String,
    },
    /// Cancellation was requested while the step ran
    Cancelled { reason: String },
}

/// Executes steps of a job
pub struct StepExecutor<A> {
    actions: A,
    catalog: ActionCatalog,
    secrets: Arc<dyn SecretStore>,
}

impl<A: ActionExecutor> StepExecutor<A> {
    pub fn new(actions: A, catalog: ActionCatalog, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            actions,
            catalog,
            secrets,
        }
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// Resolve and render a step into an invocation
    ///
    /// The action is resolved before anything is rendered, so a step whose
    /// pin does not verify never looks up a secret.
    pub fn prepare(
        &self,
        step: &Step,
        context: &PipelineContext,
        mask: &SecretMask,
    ) -> Result<ActionInvocation, ConfigurationError> {
        let resolved = match &step.kind {
            StepKind::Uses(reference) => Some(self.catalog.resolve(reference)?),
            StepKind::Run(_) => None,
        };

        let secrets = BoundSecrets::new(self.secrets.as_ref(), mask);

        let mut env = context.env.clone();
        env.extend(step.env.clone());
        let env = env
            .into_iter()
            .map(|(key, value)| Ok((key, context.render(&value, &secrets)?)))
            .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;

        let mut scope = context.clone();
        scope.env = env.clone();
        scope.current_step_id = Some(step.id.clone());

        let inputs = step
            .with
            .iter()
            .map(|(key, value)| Ok((key.clone(), scope.render(&value.render(), &secrets)?)))
            .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;
        scope.inputs = inputs.clone();

        let (action, command) = match (&step.kind, resolved) {
            (StepKind::Run(script), _) => (None, ActionCommand::Shell(scope.render(script, &secrets)?)),
            (StepKind::Uses(_), Some(resolved)) => {
                let command = match &resolved.implementation {
                    ActionImplementation::Script(template) => {
                        ActionCommand::Shell(scope.render(template, &secrets)?)
                    }
                    ActionImplementation::Builtin(builtin) => ActionCommand::Builtin(*builtin),
                };
                (Some(resolved.reference), command)
            }
            (StepKind::Uses(reference), None) => {
                return Err(ConfigurationError::UnknownAction(reference.name.clone()))
            }
        };

        Ok(ActionInvocation {
            step_id: step.id.clone(),
            action,
            command,
            inputs,
            env,
            timeout: Duration::from_secs(step.timeout_secs),
        })
    }

    /// Execute a step and return the result
    ///
    /// Errors and logs in the result are already masked.
    pub async fn execute(
        &self,
        step: &Step,
        context: &PipelineContext,
        cancel: &CancelToken,
        mask: &SecretMask,
    ) -> ExecutionResult {
        self.execute_streaming(step, context, cancel, mask, &|_: &str| {})
            .await
    }

    /// Execute a step, passing raw output lines to `on_line` as they arrive
    ///
    /// Lines are not masked; callers mask before publishing them.
    pub async fn execute_streaming(
        &self,
        step: &Step,
        context: &PipelineContext,
        cancel: &CancelToken,
        mask: &SecretMask,
        on_line: &(dyn Fn(&str) + Send + Sync),
    ) -> ExecutionResult {
        let invocation = match self.prepare(step, context, mask) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("Step {} failed to prepare: {}", step.id, e);
                return ExecutionResult::Failed {
                    error: mask.mask(&format!("configuration error: {}", e)),
                    exit_code: None,
                    log: String::new(),
                };
            }
        };

        info!("Executing step: {} ({})", step.id, invocation.label());
        debug!("Invocation for step {}: {:?}", step.id, invocation);

        // Dropping the invocation future stops the action
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ExecutionResult::Cancelled {
                reason: cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            },
            result = timeout(invocation.timeout, self.actions.invoke_streaming(&invocation, on_line)) => match result {
                Ok(Ok(outcome)) if outcome.is_success() => ExecutionResult::Success {
                    outputs: outcome.outputs,
                    log: mask.mask(&outcome.log),
                },
                Ok(Ok(outcome)) => ExecutionResult::Failed {
                    error: format!("{} exited with code {}", invocation.label(), outcome.exit_code),
                    exit_code: Some(outcome.exit_code),
                    log: mask.mask(&outcome.log),
                },
                Ok(Err(e)) => ExecutionResult::Failed {
                    error: mask.mask(&e.to_string()),
                    exit_code: None,
                    log: String::new(),
                },
                Err(_) => ExecutionResult::Failed {
                    error: format!("timed out after {}s", step.timeout_secs),
                    exit_code: None,
                    log: String::new(),
                },
            },
        }
    }

    /// Run the steps of a job in order, stopping at the first failure
    ///
    /// `record` must already be `running`. Steps after a failure end up
    /// skipped, steps after a cancellation end up cancelled, and the job
    /// takes the outcome of the last step it executed.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_job(
        &self,
        run_id: Uuid,
        job: &Job,
        mut record: JobRecord,
        mut context: PipelineContext,
        cancel: &CancelToken,
        mask: &SecretMask,
        events: &EventBus,
    ) -> JobRecord {
        context.env.extend(job.env.clone());
        let mut outcome = ExecutionStatus::Succeeded;

        for (index, step) in job.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome = ExecutionStatus::Cancelled;
                record.reason = cancel.reason();
                break;
            }

            advance(&mut record.steps[index].lifecycle, &step.id, ExecutionStatus::Running);
            events.emit(ExecutionEvent::StepStarted {
                run_id,
                job_id: job.id.clone(),
                step_id: step.id.clone(),
                name: step.name.clone(),
            });

            let on_line = |line: &str| {
                events.emit(ExecutionEvent::StepOutputLine {
                    run_id,
                    job_id: job.id.clone(),
                    step_id: step.id.clone(),
                    line: mask.mask(line),
                })
            };
            let result = self
                .execute_streaming(step, &context, cancel, mask, &on_line)
                .await;
            let step_record = &mut record.steps[index];

            let (status, error, log) = match result {
                ExecutionResult::Success { outputs, log } => {
                    step_record.exit_code = Some(0);
                    step_record.outputs = outputs
                        .iter()
                        .map(|(key, value)| (key.clone(), mask.mask(value)))
                        .collect();
                    context.set_step_outputs(&step.id, outputs);
                    (ExecutionStatus::Succeeded, None, log)
                }
                ExecutionResult::Failed {
                    error,
                    exit_code,
                    log,
                } => {
                    step_record.exit_code = exit_code;
                    step_record.error = Some(error.clone());
                    (ExecutionStatus::Failed, Some(error), log)
                }
                ExecutionResult::Cancelled { reason } => {
                    step_record.error = Some(reason.clone());
                    (ExecutionStatus::Cancelled, Some(reason), String::new())
                }
            };
            advance(&mut step_record.lifecycle, &step.id, status);

            if !log.is_empty() {
                events.emit(ExecutionEvent::StepOutput {
                    run_id,
                    job_id: job.id.clone(),
                    step_id: step.id.clone(),
                    output: log,
                });
            }
            events.emit(ExecutionEvent::StepFinished {
                run_id,
                job_id: job.id.clone(),
                step_id: step.id.clone(),
                status,
                error: error.clone(),
            });

            match status {
                ExecutionStatus::Failed => {
                    record.reason = error.map(|e| format!("step '{}' failed: {}", step.id, e));
                    outcome = status;
                    break;
                }
                ExecutionStatus::Cancelled => {
                    record.reason = error;
                    outcome = status;
                    break;
                }
                _ => {}
            }
        }

        let remaining = if outcome == ExecutionStatus::Cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Skipped
        };
        record.settle_pending_steps(remaining);

        if let Err(e) = record.transition(outcome) {
            error!("{}", e);
        }
        info!("Job {} finished: {}", job.id, outcome);
        record
    }
}

/// Apply a transition the engine knows to be valid
fn advance(lifecycle: &mut Lifecycle, subject: &str, to: ExecutionStatus) {
    if let Err(e) = lifecycle.transition(subject, to) {
        error!("{}", e);
    }
}
