use anyhow::{Context, Result};
use shipyard::action::{ActionCatalog, LocalActionExecutor};
use shipyard::cache::{CacheStore, FsCacheStore};
use shipyard::cli::commands::{
    DispatchCommand, EngineArgs, HistoryCommand, ListCommand, MatchCommand, ServeCommand,
    ValidateCommand,
};
use shipyard::cli::output::*;
use shipyard::cli::serve::serve;
use shipyard::cli::{Cli, Command};
use shipyard::core::config::WorkflowConfig;
use shipyard::core::{ExecutionStatus, PipelineRegistry, Run, StepKind, ACTION_LOCK_FILE};
use shipyard::execution::{Dispatcher, ExecutionEngine, ExecutionEvent};
#[cfg(feature = "sqlite")]
use shipyard::persistence::SqliteExecutionStore;
use shipyard::persistence::{ExecutionSummary, InMemoryPersistence, PersistenceBackend};
use shipyard::secrets::EnvSecretStore;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG overrides the default level
    let default_level = if cli.verbose { "shipyard=debug" } else { "shipyard=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    let exit_code = match &cli.command {
        Command::Dispatch(cmd) => dispatch(&cli, cmd).await?,
        Command::Serve(cmd) => serve_requests(&cli, cmd).await?,
        Command::Match(cmd) => match_event(&cli, cmd)?,
        Command::Validate(cmd) => validate_workflow(&cli, cmd)?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn load_catalog(workflows: &Path) -> Result<ActionCatalog> {
    let lock_path = workflows.join(ACTION_LOCK_FILE);
    if lock_path.exists() {
        ActionCatalog::from_file(&lock_path)
    } else {
        Ok(ActionCatalog::builtin())
    }
}

async fn open_store(no_history: bool) -> Result<Arc<dyn PersistenceBackend>> {
    if no_history {
        return Ok(Arc::new(InMemoryPersistence::new()));
    }
    #[cfg(feature = "sqlite")]
    {
        Ok(Arc::new(SqliteExecutionStore::with_default_path().await?))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        Ok(Arc::new(InMemoryPersistence::new()))
    }
}

/// Failed outranks cancelled, which outranks succeeded
fn severity(status: ExecutionStatus) -> u8 {
    match status {
        ExecutionStatus::Failed => 3,
        ExecutionStatus::Cancelled => 2,
        ExecutionStatus::Skipped => 1,
        _ => 0,
    }
}

async fn build_dispatcher(cli: &Cli, args: &EngineArgs) -> Result<Dispatcher<LocalActionExecutor>> {
    let registry = PipelineRegistry::load_dir(&cli.workflows).context("Failed to load workflows")?;
    let catalog = load_catalog(&cli.workflows)?;

    println!(
        "{} Loaded {} pipelines and {} pinned actions from {}",
        INFO,
        style(registry.len()).cyan(),
        style(catalog.len()).cyan(),
        style(cli.workflows.display()).dim()
    );

    let cache: Arc<dyn CacheStore> = match &args.cache_dir {
        Some(dir) => Arc::new(FsCacheStore::new(dir)),
        None => Arc::new(FsCacheStore::with_default_path()),
    };
    let actions = LocalActionExecutor::new(&args.working_dir, cache);
    let secrets = Arc::new(EnvSecretStore::with_prefix(&args.secret_prefix));
    let engine = ExecutionEngine::new(actions, catalog, secrets, args.scheduling_strategy());

    // Set up event handler for console output
    let stream = cli.stream;
    engine.add_event_handler(move |event| match &event {
        ExecutionEvent::StepOutputLine { .. } => {
            if stream {
                println!("{}", format_execution_event(&event));
            }
        }
        ExecutionEvent::StepOutput { .. } => {}
        _ => println!("{}", format_execution_event(&event)),
    });

    let store = open_store(args.no_history).await?;
    Ok(Dispatcher::new(registry, engine).with_store(store))
}

/// Print the final status of each run and return the worst exit code
fn report_runs(runs: &[Run], no_history: bool) -> i32 {
    let mut worst = ExecutionStatus::Succeeded;
    println!();
    for run in runs {
        if severity(run.status()) > severity(worst) {
            worst = run.status();
        }
        println!(
            "{} {} ({}) {}",
            if run.status() == ExecutionStatus::Succeeded { CHECK } else { CROSS },
            style(&run.pipeline.name).bold(),
            style(run.short_id()).dim(),
            format_status(run.status())
        );
    }
    if !no_history && !runs.is_empty() {
        println!("\n{} Runs saved to history", INFO);
    }
    worst.exit_code().unwrap_or(1)
}

async fn dispatch(cli: &Cli, cmd: &DispatchCommand) -> Result<i32> {
    let event = cmd.event.to_event().map_err(anyhow::Error::msg)?;
    let dispatcher = build_dispatcher(cli, &cmd.engine).await?;

    let handles = dispatcher.dispatch(&event)?;
    if handles.is_empty() {
        println!("{} No pipeline matches {}", INFO, style(&event).bold());
        return Ok(0);
    }

    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.wait().await?);
    }
    Ok(report_runs(&finished, cmd.engine.no_history))
}

async fn serve_requests(cli: &Cli, cmd: &ServeCommand) -> Result<i32> {
    let dispatcher = build_dispatcher(cli, &cmd.engine).await?;
    println!("{} Reading requests from stdin, one JSON object per line", INFO);

    let stdin = BufReader::new(tokio::io::stdin());
    let runs = serve(&dispatcher, stdin, |line| println!("{} {}", ROCKET, line)).await?;
    Ok(report_runs(&runs, cmd.engine.no_history))
}

fn match_event(cli: &Cli, cmd: &MatchCommand) -> Result<i32> {
    let event = cmd.event.to_event().map_err(anyhow::Error::msg)?;
    let registry = PipelineRegistry::load_dir(&cli.workflows).context("Failed to load workflows")?;
    let matching = registry.matching(&event);

    if cmd.json {
        let names: Vec<&str> = matching.iter().map(|p| p.name.as_str()).collect();
        let data = serde_json::json!({ "event": event, "pipelines": names });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(0);
    }

    if matching.is_empty() {
        println!("{} No pipeline matches {}", INFO, style(&event).bold());
        return Ok(0);
    }

    println!("{} Pipelines triggered by {}:", INFO, style(&event).bold());
    for pipeline in &matching {
        let jobs: Vec<&str> = pipeline.execution_order().iter().map(String::as_str).collect();
        println!(
            "  {} ({})",
            style(&pipeline.name).bold(),
            style(jobs.join(" -> ")).dim()
        );
    }
    Ok(0)
}

fn validate_workflow(cli: &Cli, cmd: &ValidateCommand) -> Result<i32> {
    println!("{} Validating workflow...", INFO);

    let result = WorkflowConfig::from_file(&cmd.file).and_then(|config| {
        let pipeline = config.to_pipeline()?;
        Ok((config, pipeline))
    });

    let (config, pipeline) = match result {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            return Ok(1);
        }
    };

    // Every `uses:` must verify against the lock file
    let catalog = load_catalog(&cli.workflows)?;
    let mut pin_errors = Vec::new();
    for job in pipeline.jobs.values() {
        for step in &job.steps {
            if let StepKind::Uses(reference) = &step.kind {
                if let Err(e) = catalog.resolve(reference) {
                    pin_errors.push(format!("{}/{}: {}", job.id, step.id, e));
                }
            }
        }
    }

    if !pin_errors.is_empty() {
        println!("{} Validation failed:", CROSS);
        for error in &pin_errors {
            println!("  {}", style(error).red());
        }
        return Ok(1);
    }

    println!("{} Workflow is valid!", CHECK);
    println!("  Name: {}", style(&pipeline.name).bold());
    println!("  Jobs: {}", style(pipeline.jobs.len()).cyan());
    println!("  Order: {}", style(pipeline.execution_order().join(" -> ")).dim());
    if let Some(policy) = &pipeline.concurrency {
        println!(
            "  Concurrency: {} (cancel in progress: {})",
            style(&policy.group).cyan(),
            policy.cancel_in_progress
        );
    }

    if cmd.json {
        let json = serde_json::to_string_pretty(&config)?;
        println!("\n{}", json);
    }
    Ok(0)
}

async fn list_pipelines(cmd: &ListCommand) -> Result<i32> {
    let store = open_store(false).await?;
    let pipelines = store.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(0);
    }

    let mut json_data = Vec::new();
    if !cmd.json {
        println!("{} Pipelines in history:", INFO);
    }

    for pipeline_name in &pipelines {
        let runs = store.list_runs(pipeline_name, u32::MAX as usize).await?;
        let count = |status: ExecutionStatus| runs.iter().filter(|r| r.status == status).count();

        if cmd.json {
            json_data.push(serde_json::json!({
                "name": pipeline_name,
                "run_count": runs.len(),
                "succeeded": count(ExecutionStatus::Succeeded),
                "failed": count(ExecutionStatus::Failed),
                "cancelled": count(ExecutionStatus::Cancelled),
            }));
        } else if cmd.with_counts {
            println!(
                "  {} ({} runs: {} succeeded, {} failed, {} cancelled)",
                style(pipeline_name).bold(),
                style(runs.len()).cyan(),
                style(count(ExecutionStatus::Succeeded)).green(),
                style(count(ExecutionStatus::Failed)).red(),
                style(count(ExecutionStatus::Cancelled)).yellow()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    if cmd.json {
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(0)
}

async fn show_history(cmd: &HistoryCommand) -> Result<i32> {
    let store = open_store(false).await?;

    // If a specific run is requested
    if let Some(run_id) = &cmd.run_id {
        let run_id = uuid::Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary, cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(0);
    }

    let runs = if let Some(pipeline_name) = &cmd.pipeline {
        store.list_runs(pipeline_name, cmd.limit).await?
    } else {
        let mut all_runs = Vec::new();
        for pipeline in store.list_pipelines().await? {
            all_runs.extend(store.list_runs(&pipeline, cmd.limit).await?);
        }
        all_runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all_runs.truncate(cmd.limit);
        all_runs
    };

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(0);
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(0);
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_execution_summary(summary));
    }

    Ok(0)
}

fn print_run_details(summary: &ExecutionSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Event: {} {}", summary.event, style(&summary.git_ref).cyan());
    if let Some(group) = &summary.group {
        println!("  Group: {}", style(group).dim());
    }
    println!("  Status: {}", format_status(summary.status));
    if let Some(reason) = &summary.cancel_reason {
        println!("  Cancelled: {}", style(reason).yellow());
    }
    if let Some(started) = summary.started_at {
        println!("  Started: {}", style(started.to_rfc3339()).dim());
        if let Some(completed) = summary.completed_at {
            if let Ok(duration) = completed.signed_duration_since(started).to_std() {
                println!("  Duration: {}", style(format_duration(duration)).dim());
            }
        }
    }
    println!(
        "  Jobs: {} succeeded, {} failed, {} skipped, {} cancelled of {}",
        style(summary.succeeded_jobs).green(),
        style(summary.failed_jobs).red(),
        summary.skipped_jobs,
        summary.cancelled_jobs,
        summary.total_jobs
    );

    for job in &summary.jobs {
        println!("\n  {} {}", format_status(job.status()), style(&job.id).bold());
        if let Some(reason) = &job.reason {
            println!("    {}", style(reason).dim());
        }
        for step in &job.steps {
            let detail = step.error.as_deref().unwrap_or_default();
            println!(
                "    {} {} {}",
                format_status(step.status()),
                style(&step.id).cyan(),
                style(detail).dim()
            );
        }
    }

    Ok(())
}
