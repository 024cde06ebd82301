//! Pipeline domain model

use crate::core::{
    config::{ConfigurationError, WorkflowConfig},
    context::{NoSecrets, PipelineContext},
    job::Job,
    step::StepDefaults,
    trigger::{EventKind, RepositoryEvent, Trigger},
};
use std::collections::{BTreeMap, HashSet};

/// Concurrency group policy of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    /// Group key template
    pub group: String,

    /// Cancel the in-progress run of the group when a new run is created
    pub cancel_in_progress: bool,
}

/// A pipeline definition
///
/// Immutable once loaded; runs share it through an `Arc`.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Trigger predicates; the pipeline runs when any matches
    pub triggers: Vec<Trigger>,

    pub concurrency: Option<ConcurrencyPolicy>,

    /// Environment for every job
    pub env: BTreeMap<String, String>,

    /// Jobs keyed by id
    pub jobs: BTreeMap<String, Job>,

    /// Job order (topological sort)
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &WorkflowConfig) -> Result<Self, ConfigurationError> {
        let defaults = StepDefaults {
            timeout_secs: config
                .default_timeout_secs
                .unwrap_or(StepDefaults::default().timeout_secs),
        };

        let jobs = config
            .jobs
            .iter()
            .map(|(id, job_config)| Ok((id.clone(), Job::from_config(id, job_config, &defaults)?)))
            .collect::<Result<BTreeMap<_, _>, ConfigurationError>>()?;

        let execution_order = Self::topological_sort(&jobs);

        Ok(Pipeline {
            name: config.name.clone(),
            triggers: Self::triggers_from_config(config),
            concurrency: config.concurrency.as_ref().map(|c| ConcurrencyPolicy {
                group: c.group.clone(),
                cancel_in_progress: c.cancel_in_progress,
            }),
            env: config.env.clone(),
            jobs,
            execution_order,
        })
    }

    fn triggers_from_config(config: &WorkflowConfig) -> Vec<Trigger> {
        let mut triggers = Vec::new();

        if let Some(push) = &config.triggers.push {
            let any_kind = push.branches.is_empty() && push.tags.is_empty();
            if any_kind || !push.branches.is_empty() {
                triggers.push(Trigger::new(EventKind::PushBranch, &push.branches));
            }
            if any_kind || !push.tags.is_empty() {
                triggers.push(Trigger::new(EventKind::PushTag, &push.tags));
            }
        }

        if let Some(pull_request) = &config.triggers.pull_request {
            triggers.push(Trigger::new(EventKind::PullRequest, &pull_request.branches));
        }

        triggers
    }

    /// Whether any trigger matches the event
    pub fn matches(&self, event: &RepositoryEvent) -> bool {
        self.triggers.iter().any(|trigger| trigger.matches(event))
    }

    /// Get a job by ID
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Base context for a run of this pipeline
    pub fn context_for_run(&self, event: &RepositoryEvent, run_id: &str) -> PipelineContext {
        let mut context = PipelineContext::new();
        context.set_variable("workflow", self.name.clone());
        context.set_variable("event_name", event.event_name());
        context.set_variable("ref", event.git_ref());
        context.set_variable("ref_name", event.match_ref());
        context.set_variable("head_ref", event.head_ref().unwrap_or_default());
        context.set_variable("run_id", run_id);
        context.env.extend(self.env.clone());
        context
    }

    /// Concurrency group key for a run, if the pipeline is grouped
    pub fn group_key(
        &self,
        event: &RepositoryEvent,
        run_id: &str,
    ) -> Result<Option<String>, ConfigurationError> {
        match &self.concurrency {
            Some(policy) => {
                let context = self.context_for_run(event, run_id);
                Ok(Some(context.render(&policy.group, &NoSecrets)?))
            }
            None => Ok(None),
        }
    }

    /// Calculate topological sort of jobs based on `needs`
    fn topological_sort(jobs: &BTreeMap<String, Job>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        // BTreeMap keys are already sorted, so the order is deterministic
        for job_id in jobs.keys() {
            Self::visit(job_id, jobs, &mut visited, &mut result);
        }

        result
    }

    fn visit(
        job_id: &str,
        jobs: &BTreeMap<String, Job>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(job_id.to_string()) {
            return;
        }

        if let Some(job) = jobs.get(job_id) {
            for dep in &job.needs {
                Self::visit(dep, jobs, visited, result);
            }
        }

        result.push(job_id.to_string());
    }
}
