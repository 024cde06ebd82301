//! Job domain model

use crate::core::{
    config::{ConfigurationError, JobConfig},
    state::{JobRecord, StepRecord},
    step::{Step, StepDefaults},
};
use std::collections::{BTreeMap, HashSet};

/// An ordered sequence of steps with optional dependencies on other jobs
#[derive(Debug, Clone)]
pub struct Job {
    /// Identifier, unique within the pipeline
    pub id: String,

    /// Display name
    pub name: String,

    /// Jobs that must succeed before this one starts
    pub needs: Vec<String>,

    /// Environment shared by every step of the job
    pub env: BTreeMap<String, String>,

    /// Steps, in declaration order
    pub steps: Vec<Step>,
}

impl Job {
    pub fn from_config(
        id: &str,
        config: &JobConfig,
        defaults: &StepDefaults,
    ) -> Result<Self, ConfigurationError> {
        let defaults = StepDefaults {
            timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
        };

        let steps = Step::from_configs(&config.steps, &defaults)?;

        Ok(Job {
            id: id.to_string(),
            name: config.name.clone().unwrap_or_else(|| id.to_string()),
            needs: config.needs.clone(),
            env: config.env.clone(),
            steps,
        })
    }

    /// Check if every dependency is in `succeeded`
    pub fn dependencies_satisfied(&self, succeeded: &HashSet<String>) -> bool {
        self.needs.iter().all(|dep| succeeded.contains(dep))
    }

    /// Fresh record for a run of this job
    pub fn new_record(&self) -> JobRecord {
        JobRecord::new(
            &self.id,
            self.steps
                .iter()
                .map(|step| StepRecord::new(&step.id, &step.name))
                .collect(),
        )
    }
}
