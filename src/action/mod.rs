//! Action invocation interface
//!
//! Steps call opaque actions: inline scripts, scripts from the action lock
//! file, or builtins. The engine only needs a success/failure outcome and the
//! outputs an action emits.

pub mod catalog;
pub mod local;
pub mod response;

use crate::core::ActionRef;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

pub use catalog::{ActionCatalog, ActionImplementation, ActionLockConfig, BuiltinAction, ResolvedAction};
pub use local::LocalActionExecutor;
pub use response::{ActionError, ActionOutcome};

/// What to execute for a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionCommand {
    /// Shell script, already rendered
    Shell(String),
    /// Builtin implemented by the executor
    Builtin(BuiltinAction),
}

/// A fully rendered step invocation
///
/// `env` may carry secret values; never log it.
#[derive(Clone)]
pub struct ActionInvocation {
    pub step_id: String,

    /// Action reference for `uses:` steps, `None` for `run:` steps
    pub action: Option<ActionRef>,

    pub command: ActionCommand,

    /// Rendered `with:` parameters
    pub inputs: BTreeMap<String, String>,

    /// Rendered environment
    pub env: BTreeMap<String, String>,

    pub timeout: Duration,
}

impl ActionInvocation {
    /// Label for logs: the action reference or the step id
    pub fn label(&self) -> String {
        match &self.action {
            Some(action) => action.to_string(),
            None => format!("run ({})", self.step_id),
        }
    }
}

impl std::fmt::Debug for ActionInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionInvocation")
            .field("step_id", &self.step_id)
            .field("action", &self.action)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Trait for action execution - allows for different implementations
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Invoke the action and report its outcome
    async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutcome, ActionError>;

    /// Invoke the action, handing each output line to `on_line` as it arrives
    ///
    /// The default replays the log once the action has finished.
    async fn invoke_streaming(
        &self,
        invocation: &ActionInvocation,
        on_line: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<ActionOutcome, ActionError> {
        let outcome = self.invoke(invocation).await?;
        for line in outcome.log.lines() {
            on_line(line);
        }
        Ok(outcome)
    }
}

/// Collect `::set-output name=<key>::<value>` lines from command output
pub fn parse_outputs(stdout: &str) -> BTreeMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("::set-output name="))
        .filter_map(|rest| rest.split_once("::"))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
