//! Registry of the pipelines defined in a workflows directory

use crate::core::{config::WorkflowConfig, Pipeline, RepositoryEvent};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Action lock file name inside the workflows directory
pub const ACTION_LOCK_FILE: &str = "actions.yml";

/// Every pipeline known to the engine, in load order
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: Vec<Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new(pipelines: impl IntoIterator<Item = Pipeline>) -> Self {
        Self {
            pipelines: pipelines.into_iter().map(Arc::new).collect(),
        }
    }

    /// Workflow files of a directory, sorted, without the action lock file
    pub fn workflow_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let mut files = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read workflows directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yml" | "yaml")
                )
            })
            .filter(|path| {
                path.file_name().and_then(|n| n.to_str()) != Some(ACTION_LOCK_FILE)
            })
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }

    /// Load and validate every workflow file of a directory
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let mut pipelines = Vec::new();
        for path in Self::workflow_files(&dir)? {
            let pipeline = WorkflowConfig::from_file(&path)?
                .to_pipeline()
                .with_context(|| format!("Invalid workflow {}", path.display()))?;
            debug!("Loaded pipeline {} from {}", pipeline.name, path.display());
            pipelines.push(pipeline);
        }
        Ok(Self::new(pipelines))
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Pipeline>> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Pipelines whose triggers match the event; empty when none do
    pub fn matching(&self, event: &RepositoryEvent) -> Vec<Arc<Pipeline>> {
        self.pipelines
            .iter()
            .filter(|pipeline| pipeline.matches(event))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
