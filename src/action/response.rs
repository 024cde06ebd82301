//! Action outcome types

use crate::cache::CacheError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Error types for action invocation
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to start action: {0}")]
    Spawn(String),

    #[error("missing required input '{0}'")]
    MissingInput(String),

    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome reported by an action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Exit code; zero is success
    pub exit_code: i32,

    /// Outputs for later steps of the same job
    pub outputs: BTreeMap<String, String>,

    /// Combined stdout/stderr
    pub log: String,
}

impl ActionOutcome {
    /// Create a successful outcome
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(exit_code: i32, log: impl Into<String>) -> Self {
        Self {
            exit_code,
            outputs: BTreeMap::new(),
            log: log.into(),
        }
    }

    pub fn with_output(mut self, key: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}
