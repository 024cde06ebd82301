//! Event dispatcher - turns repository events into governed runs

use crate::{
    action::ActionExecutor,
    core::{config::ConfigurationError, PipelineRegistry, RepositoryEvent, Run},
    execution::{CancelToken, ConcurrencyGovernor, ExecutionEngine, ExecutionEvent},
    persistence::{create_summary, PersistenceBackend},
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// A run that has been created and handed to the governor
pub struct RunHandle {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub group: Option<String>,
    cancel: CancelToken,
    handle: JoinHandle<Run>,
}

impl RunHandle {
    /// Request cancellation of this run
    pub fn cancel(&self, reason: &str) -> bool {
        self.cancel.cancel(reason)
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> anyhow::Result<Run> {
        Ok(self.handle.await?)
    }
}

/// Creates runs for matching pipelines and drives them through the governor
pub struct Dispatcher<A> {
    registry: Arc<PipelineRegistry>,
    engine: Arc<ExecutionEngine<A>>,
    governor: ConcurrencyGovernor,
    store: Option<Arc<dyn PersistenceBackend>>,
}

impl<A: ActionExecutor + 'static> Dispatcher<A> {
    pub fn new(registry: PipelineRegistry, engine: ExecutionEngine<A>) -> Self {
        Self {
            registry: Arc::new(registry),
            engine: Arc::new(engine),
            governor: ConcurrencyGovernor::new(),
            store: None,
        }
    }

    /// Archive every finished run to `store`
    pub fn with_store(mut self, store: Arc<dyn PersistenceBackend>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn engine(&self) -> &ExecutionEngine<A> {
        &self.engine
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    /// Create one run per matching pipeline and start them
    ///
    /// Runs are registered with the governor before this returns, so events
    /// dispatched one after another are governed in that order. An event no
    /// pipeline matches yields no runs.
    pub fn dispatch(&self, event: &RepositoryEvent) -> Result<Vec<RunHandle>, ConfigurationError> {
        let runs = self
            .registry
            .matching(event)
            .into_iter()
            .map(|pipeline| Run::new(pipeline, event.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        if runs.is_empty() {
            info!("No pipeline matches {}", event);
        }

        Ok(runs.into_iter().map(|run| self.start(run)).collect())
    }

    fn start(&self, mut run: Run) -> RunHandle {
        let cancel = CancelToken::new();
        let cancel_in_progress = run
            .pipeline
            .concurrency
            .as_ref()
            .is_some_and(|policy| policy.cancel_in_progress);
        let admission =
            self.governor
                .register(run.group.as_deref(), run.id, cancel_in_progress, &cancel);

        info!(
            "Created run {} of {} for {}",
            run.short_id(),
            run.pipeline.name,
            run.event
        );
        self.engine.events().emit(ExecutionEvent::RunQueued {
            run_id: run.id,
            pipeline_name: run.pipeline.name.clone(),
            group: run.group.clone(),
        });

        let run_id = run.id;
        let pipeline_name = run.pipeline.name.clone();
        let group = run.group.clone();
        let engine = self.engine.clone();
        let store = self.store.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let permit = admission.admitted().await;
            if token.is_cancelled() {
                engine.cancel_queued(&mut run, &token);
            } else {
                engine.execute(&mut run, &token).await;
            }

            if let Some(store) = store {
                if let Err(e) = store.save_run(&create_summary(&run)).await {
                    error!("Failed to archive run {}: {:#}", run.short_id(), e);
                }
            }
            // The next run of the group starts once the archive is written
            drop(permit);
            run
        });

        RunHandle {
            run_id,
            pipeline_name,
            group,
            cancel,
            handle,
        }
    }
}
