//! Step domain model

use crate::core::config::{ConfigurationError, StepConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Pinned revision of an action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Pin {
    /// Full 40 character commit hash
    Sha(String),
    /// Tag or version label (`v2`, `stable`, `1.4.0`)
    Version(String),
}

impl Pin {
    pub fn parse(raw: &str) -> Self {
        if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Pin::Sha(raw.to_ascii_lowercase())
        } else {
            Pin::Version(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Pin::Sha(value) | Pin::Version(value) => value,
        }
    }

    pub fn is_content_hash(&self) -> bool {
        matches!(self, Pin::Sha(_))
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `name@pin` reference to an external action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionRef {
    pub name: String,
    pub pin: Pin,
}

impl ActionRef {
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        match raw.rsplit_once('@') {
            Some((name, pin)) if !name.is_empty() && !pin.is_empty() => Ok(Self {
                name: name.to_string(),
                pin: Pin::parse(pin),
            }),
            _ => Err(ConfigurationError::InvalidActionRef(raw.to_string())),
        }
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.pin)
    }
}

/// Step parameter value (`with:` entries)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawParam", into = "RawParam")]
pub enum ParamValue {
    String(String),
    Bool(bool),
}

impl ParamValue {
    /// Render as the string an action receives
    pub fn render(&self) -> String {
        match self {
            ParamValue::String(s) => s.clone(),
            ParamValue::Bool(b) => b.to_string(),
        }
    }
}

/// Wire shape of a parameter; numbers are kept as their string form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<RawParam> for ParamValue {
    fn from(raw: RawParam) -> Self {
        match raw {
            RawParam::Bool(b) => ParamValue::Bool(b),
            RawParam::Int(i) => ParamValue::String(i.to_string()),
            RawParam::Float(f) => ParamValue::String(f.to_string()),
            RawParam::String(s) => ParamValue::String(s),
        }
    }
}

impl From<ParamValue> for RawParam {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Bool(b) => RawParam::Bool(b),
            ParamValue::String(s) => RawParam::String(s),
        }
    }
}

/// What a step invokes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// External action resolved through the action catalog
    Uses(ActionRef),
    /// Inline shell script
    Run(String),
}

/// A single step in a job
#[derive(Debug, Clone)]
pub struct Step {
    /// Identifier, unique within the job
    pub id: String,

    /// Display name
    pub name: String,

    pub kind: StepKind,

    /// Action parameters
    pub with: BTreeMap<String, ParamValue>,

    /// Environment for the invocation, rendered at invocation time
    pub env: BTreeMap<String, String>,

    /// Timeout in seconds
    pub timeout_secs: u64,
}

impl Step {
    /// Create a step from a step config
    ///
    /// `index` is the position within the job and names anonymous steps.
    pub fn from_config(
        config: &StepConfig,
        index: usize,
        defaults: &StepDefaults,
    ) -> Result<Self, ConfigurationError> {
        let kind = match (&config.uses, &config.run) {
            (Some(uses), None) => StepKind::Uses(ActionRef::parse(uses)?),
            (None, Some(run)) => StepKind::Run(run.clone()),
            _ => return Err(ConfigurationError::AmbiguousStep(config.label(index))),
        };

        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("step-{}", index + 1));

        let name = config.name.clone().unwrap_or_else(|| match &kind {
            StepKind::Uses(action) => action.name.clone(),
            StepKind::Run(script) => script.lines().next().unwrap_or_default().to_string(),
        });

        Ok(Step {
            id,
            name,
            kind,
            with: config.with.clone(),
            env: config.env.clone(),
            timeout_secs: config.timeout_secs.unwrap_or(defaults.timeout_secs),
        })
    }

    /// Create the steps of one job
    ///
    /// Anonymous steps are named `step-<position>`, or `step-<position>-<n>`
    /// when that id is declared elsewhere in the job. Declared ids are kept
    /// as written, so duplicates among them still surface in validation.
    pub fn from_configs(
        configs: &[StepConfig],
        defaults: &StepDefaults,
    ) -> Result<Vec<Self>, ConfigurationError> {
        let mut taken: HashSet<String> = configs.iter().filter_map(|c| c.id.clone()).collect();

        configs
            .iter()
            .enumerate()
            .map(|(index, config)| {
                let mut step = Self::from_config(config, index, defaults)?;
                if config.id.is_none() {
                    let base = step.id.clone();
                    let mut suffix = 2;
                    while taken.contains(&step.id) {
                        step.id = format!("{}-{}", base, suffix);
                        suffix += 1;
                    }
                    taken.insert(step.id.clone());
                }
                Ok(step)
            })
            .collect()
    }

    /// Every template string the step renders at invocation time
    pub fn templates(&self) -> impl Iterator<Item = &str> {
        let script = match &self.kind {
            StepKind::Run(script) => Some(script.as_str()),
            StepKind::Uses(_) => None,
        };
        script
            .into_iter()
            .chain(self.env.values().map(String::as_str))
            .chain(self.with.values().filter_map(|v| match v {
                ParamValue::String(s) => Some(s.as_str()),
                ParamValue::Bool(_) => None,
            }))
    }
}

#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub timeout_secs: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 1800, // 30 minutes
        }
    }
}
