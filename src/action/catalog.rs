//! Pinned action catalog
//!
//! Every `uses:` reference must resolve against the action lock file. The
//! lock file records the single pin each action may be used at, and how the
//! action is carried out locally.

use crate::core::{config::ConfigurationError, ActionRef, Pin};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Reference of the builtin cache action
pub const CACHE_ACTION: &str = "shipyard/cache";
pub const CACHE_ACTION_PIN: &str = "v1";

/// Actions implemented by the executor itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinAction {
    /// Restore/save a path in the shared dependency cache
    Cache,
}

/// How a resolved action is carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionImplementation {
    /// Shell script template; `${{ inputs.* }}` refer to the step's `with:`
    Script(String),
    Builtin(BuiltinAction),
}

/// Action lock file (`actions.yml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionLockConfig {
    #[serde(default)]
    pub actions: BTreeMap<String, ActionLockEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLockEntry {
    /// Only pin this action may be referenced at
    pub pin: String,

    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub builtin: Option<BuiltinAction>,
}

impl ActionLockConfig {
    /// Load a lock file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read action lock file: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ActionLockConfig =
            serde_yaml::from_str(yaml).context("Failed to parse action lock YAML")?;
        Ok(config)
    }
}

/// A `uses:` reference that passed pin verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAction {
    pub reference: ActionRef,
    pub implementation: ActionImplementation,
}

/// Pinned actions available to steps
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    entries: HashMap<String, (Pin, ActionImplementation)>,
}

impl ActionCatalog {
    /// Catalog with only the builtin actions
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            CACHE_ACTION.to_string(),
            (
                Pin::parse(CACHE_ACTION_PIN),
                ActionImplementation::Builtin(BuiltinAction::Cache),
            ),
        );
        Self { entries }
    }

    /// Builtins plus every entry of the lock file
    pub fn from_config(config: &ActionLockConfig) -> Result<Self> {
        let mut catalog = Self::builtin();
        for (name, entry) in &config.actions {
            let implementation = match (&entry.run, entry.builtin) {
                (Some(run), None) => ActionImplementation::Script(run.clone()),
                (None, Some(builtin)) => ActionImplementation::Builtin(builtin),
                _ => anyhow::bail!(
                    "Action '{}' must declare exactly one of 'run' or 'builtin'",
                    name
                ),
            };
            catalog = catalog.with_action(name, &entry.pin, implementation);
        }
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(&ActionLockConfig::from_file(path)?)
    }

    /// Add or replace an action
    pub fn with_action(mut self, name: &str, pin: &str, implementation: ActionImplementation) -> Self {
        self.entries
            .insert(name.to_string(), (Pin::parse(pin), implementation));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify a reference against its locked pin
    ///
    /// A tag never satisfies a locked commit hash and vice versa; the pin
    /// must be exactly the locked one.
    pub fn resolve(&self, reference: &ActionRef) -> Result<ResolvedAction, ConfigurationError> {
        let (locked, implementation) = self
            .entries
            .get(&reference.name)
            .ok_or_else(|| ConfigurationError::UnknownAction(reference.name.clone()))?;

        if locked != &reference.pin {
            return Err(ConfigurationError::PinMismatch {
                action: reference.name.clone(),
                requested: reference.pin.to_string(),
                locked: locked.to_string(),
            });
        }

        Ok(ResolvedAction {
            reference: reference.clone(),
            implementation: implementation.clone(),
        })
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
