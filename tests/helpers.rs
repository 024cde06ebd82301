//! Test utility functions for shipyard scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use shipyard::action::{ActionCatalog, ActionCommand, ActionError, ActionExecutor, ActionInvocation, ActionOutcome};
use shipyard::core::{ExecutionStatus, PipelineRegistry, RepositoryEvent, Run};
use shipyard::execution::{Dispatcher, ExecutionEngine, ExecutionEvent, SchedulingStrategy};
use shipyard::persistence::InMemoryPersistence;
use shipyard::secrets::{MemorySecretStore, Secret, SecretStore};

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One call the engine made into the action layer
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step_id: String,
    pub label: String,
    pub script: Option<String>,
    pub inputs: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
}

/// Mock action layer that succeeds unless a script matches a failure rule
///
/// Clones share the invocation log, so a test can keep one clone while the
/// engine owns the other.
#[derive(Clone, Default)]
pub struct MockActions {
    failures: Arc<Vec<(String, i32)>>,
    delay: Option<Duration>,
    echo_env: bool,
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl MockActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every script containing `needle` with `exit_code`
    pub fn fail_when(mut self, needle: &str, exit_code: i32) -> Self {
        let mut failures = (*self.failures).clone();
        failures.push((needle.to_string(), exit_code));
        self.failures = Arc::new(failures);
        self
    }

    /// Sleep before answering every invocation
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Write the invocation env into the action log
    pub fn echo_env(mut self) -> Self {
        self.echo_env = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter_map(|invocation| invocation.script)
            .collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.scripts().iter().filter(|script| script.contains(needle)).count()
    }
}

#[async_trait]
impl ActionExecutor for MockActions {
    async fn invoke(&self, invocation: &ActionInvocation) -> Result<ActionOutcome, ActionError> {
        let script = match &invocation.command {
            ActionCommand::Shell(script) => Some(script.clone()),
            ActionCommand::Builtin(_) => None,
        };
        self.invocations.lock().unwrap().push(Invocation {
            step_id: invocation.step_id.clone(),
            label: invocation.label(),
            script: script.clone(),
            inputs: invocation.inputs.clone().into_iter().collect(),
            env: invocation.env.clone().into_iter().collect(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let log = if self.echo_env {
            invocation
                .env
                .iter()
                .map(|(key, value)| format!("{}={}\n", key, value))
                .collect()
        } else {
            String::new()
        };

        let failure = script.as_deref().and_then(|script| {
            self.failures
                .iter()
                .find(|(needle, _)| script.contains(needle.as_str()))
        });
        match (failure, &invocation.command) {
            (Some((_, code)), _) => Ok(ActionOutcome::failure(*code, log)),
            (None, ActionCommand::Builtin(_)) => Ok(ActionOutcome::success().with_output("cache-hit", "false")),
            (None, ActionCommand::Shell(_)) => Ok(ActionOutcome {
                log,
                ..ActionOutcome::success()
            }),
        }
    }
}

/// Secret store that counts lookups
pub struct CountingSecrets {
    inner: MemorySecretStore,
    lookups: AtomicUsize,
}

impl CountingSecrets {
    pub fn new(inner: MemorySecretStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SecretStore for CountingSecrets {
    fn get(&self, name: &str) -> Option<Secret> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get(name)
    }
}

/// The workflow directory shipped with the crate
pub fn workflows_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("workflows")
}

pub fn shipped_registry() -> PipelineRegistry {
    PipelineRegistry::load_dir(workflows_dir()).expect("shipped workflows load")
}

pub fn shipped_catalog() -> ActionCatalog {
    ActionCatalog::from_file(workflows_dir().join("actions.yml")).expect("shipped lock file loads")
}

/// Dispatcher over the shipped workflows
pub fn dispatcher(actions: MockActions, secrets: Arc<dyn SecretStore>) -> Dispatcher<MockActions> {
    let engine = ExecutionEngine::new(actions, shipped_catalog(), secrets, SchedulingStrategy::Parallel);
    Dispatcher::new(shipped_registry(), engine)
}

/// Collect every event the dispatcher's engine emits
pub fn record_events(dispatcher: &Dispatcher<MockActions>) -> Arc<Mutex<Vec<ExecutionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    dispatcher
        .engine()
        .add_event_handler(move |event| sink.lock().unwrap().push(event));
    events
}

pub fn archive() -> Arc<InMemoryPersistence> {
    Arc::new(InMemoryPersistence::new())
}

/// Dispatch an event and wait for every run it created
pub async fn dispatch_and_wait(dispatcher: &Dispatcher<MockActions>, event: &RepositoryEvent) -> Vec<Run> {
    let handles = dispatcher.dispatch(event).expect("event dispatches");
    let mut runs = Vec::new();
    for handle in handles {
        runs.push(handle.wait().await.expect("run task completes"));
    }
    runs
}

pub fn job_status(run: &Run, job: &str) -> ExecutionStatus {
    run.job(job)
        .unwrap_or_else(|| panic!("run has no job '{}'", job))
        .status()
}

pub fn step_statuses(run: &Run, job: &str) -> Vec<ExecutionStatus> {
    run.job(job)
        .unwrap_or_else(|| panic!("run has no job '{}'", job))
        .steps
        .iter()
        .map(|step| step.status())
        .collect()
}

pub fn pull_request(number: u64, head: &str) -> RepositoryEvent {
    RepositoryEvent::pull_request(number, "main", head)
}
