//! Workflow configuration from YAML

use crate::core::{context, Pipeline};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Configuration errors: fatal, never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("invalid action reference '{0}', expected <name>@<sha-or-version>")]
    InvalidActionRef(String),

    #[error("{0} must declare exactly one of 'uses' or 'run'")]
    AmbiguousStep(String),

    #[error("action '{0}' is not in the action lock file")]
    UnknownAction(String),

    #[error("action '{action}' is pinned to {requested} but the lock file has {locked}")]
    PinMismatch {
        action: String,
        requested: String,
        locked: String,
    },

    #[error("secret '{0}' is not available")]
    MissingSecret(String),

    #[error("job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("cycle detected in job dependencies involving '{0}'")]
    DependencyCycle(String),

    #[error("job '{job}' declares step id '{step}' more than once")]
    DuplicateStepId { job: String, step: String },

    #[error("invalid expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

/// Top-level workflow configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name
    pub name: String,

    /// Trigger conditions
    #[serde(rename = "on", default)]
    pub triggers: TriggerConfig,

    /// Concurrency group policy
    #[serde(default)]
    pub concurrency: Option<ConcurrencyConfig>,

    /// Environment for every job
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Default step timeout (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Jobs keyed by id
    pub jobs: BTreeMap<String, JobConfig>,
}

/// `on:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub push: Option<PushTriggerConfig>,

    #[serde(default)]
    pub pull_request: Option<PullRequestTriggerConfig>,
}

/// Push trigger: branch and/or tag patterns
///
/// With neither list every push matches; with only one list, only pushes
/// of that kind match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushTriggerConfig {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Pull request trigger: patterns over the base branch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestTriggerConfig {
    #[serde(default)]
    pub branches: Vec<String>,
}

/// Concurrency group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Group key template, e.g. `${{ workflow }}-${{ head_ref || run_id }}`
    pub group: String,

    /// Cancel the in-progress run of the group when a new one starts
    #[serde(default, alias = "cancel-in-progress")]
    pub cancel_in_progress: bool,
}

/// Job configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Human-readable job name
    #[serde(default)]
    pub name: Option<String>,

    /// Job ids this job depends on
    #[serde(default)]
    pub needs: Vec<String>,

    /// Timeout applied to each step unless the step overrides it
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step identifier, used to reference outputs
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// Pinned action reference (`name@sha` or `name@version`)
    #[serde(default)]
    pub uses: Option<String>,

    /// Inline shell script
    #[serde(default)]
    pub run: Option<String>,

    /// Action parameters
    #[serde(default)]
    pub with: BTreeMap<String, crate::core::step::ParamValue>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl StepConfig {
    /// Human label for error messages
    pub fn label(&self, index: usize) -> String {
        match (&self.id, &self.name) {
            (Some(id), _) => format!("step '{}'", id),
            (None, Some(name)) => format!("step '{}'", name),
            (None, None) => format!("step #{}", index + 1),
        }
    }
}

impl WorkflowConfig {
    /// Load workflow configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid workflow {}", path.display()))
    }

    /// Parse workflow configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the workflow configuration
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            anyhow::bail!("Workflow '{}' declares no jobs", self.name);
        }

        if let Some(concurrency) = &self.concurrency {
            if concurrency.group.trim().is_empty() {
                anyhow::bail!("Workflow '{}' has an empty concurrency group", self.name);
            }
            for expression in context::expressions(&concurrency.group) {
                context::parse_expression(expression)?;
                if expression.contains("secrets.") {
                    return Err(ConfigurationError::InvalidExpression {
                        expression: expression.to_string(),
                        reason: "secrets cannot be used in a concurrency group".to_string(),
                    }
                    .into());
                }
            }
        }

        for (job_id, job) in &self.jobs {
            for dep in &job.needs {
                if dep == job_id {
                    return Err(ConfigurationError::DependencyCycle(job_id.clone()).into());
                }
                if !self.jobs.contains_key(dep) {
                    return Err(ConfigurationError::UnknownDependency {
                        job: job_id.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
            self.validate_steps(job_id, job)?;
        }

        // Check for cycles in the job dependency graph
        self.check_cycles()?;

        Ok(())
    }

    fn validate_steps(&self, job_id: &str, job: &JobConfig) -> Result<()> {
        let mut seen_ids = HashSet::new();

        for pipeline_step in crate::core::step::Step::from_configs(&job.steps, &Default::default())? {
            if !seen_ids.insert(pipeline_step.id.clone()) {
                return Err(ConfigurationError::DuplicateStepId {
                    job: job_id.to_string(),
                    step: pipeline_step.id,
                }
                .into());
            }

            // Outputs can only flow forward within a job
            for template in pipeline_step.templates() {
                for expression in context::expressions(template) {
                    for path in context::parse_expression(expression)? {
                        if let Some(referenced) = context::referenced_step(path) {
                            if !seen_ids.contains(referenced) || referenced == pipeline_step.id {
                                return Err(ConfigurationError::InvalidExpression {
                                    expression: expression.to_string(),
                                    reason: format!(
                                        "step '{}' is not an earlier step of job '{}'",
                                        referenced, job_id
                                    ),
                                }
                                .into());
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Check for cycles in the `needs` graph
    fn check_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for job_id in self.jobs.keys() {
            if !visited.contains(job_id) {
                self.dfs_check(job_id, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        &self,
        job_id: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(job_id.to_string());
        recursion_stack.insert(job_id.to_string());

        if let Some(job) = self.jobs.get(job_id) {
            for dep in &job.needs {
                if recursion_stack.contains(dep) {
                    return Err(ConfigurationError::DependencyCycle(dep.clone()).into());
                }
                if !visited.contains(dep) {
                    self.dfs_check(dep, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(job_id);
        Ok(())
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Result<Pipeline> {
        Ok(Pipeline::from_config(self)?)
    }
}
