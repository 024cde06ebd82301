//! CLI command definitions

use crate::core::RepositoryEvent;
use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Kind of repository event to simulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EventTypeArg {
    Push,
    PullRequest,
}

/// Repository event description shared by `dispatch` and `match`
#[derive(Debug, Args, Clone)]
pub struct EventArgs {
    /// Event type
    #[arg(long, value_enum)]
    pub event: EventTypeArg,

    /// Pushed ref (`refs/heads/main`, `refs/tags/v1.0.0`, `main`) or the
    /// base branch of a pull request
    #[arg(long = "ref")]
    pub git_ref: String,

    /// Source branch of a pull request
    #[arg(long)]
    pub head: Option<String>,

    /// Pull request number
    #[arg(long)]
    pub number: Option<u64>,
}

impl EventArgs {
    pub fn to_event(&self) -> Result<RepositoryEvent, String> {
        match self.event {
            EventTypeArg::Push => Ok(RepositoryEvent::push(&self.git_ref)),
            EventTypeArg::PullRequest => {
                let head = self
                    .head
                    .as_deref()
                    .ok_or("--head is required for pull-request events")?;
                let number = self
                    .number
                    .ok_or("--number is required for pull-request events")?;
                Ok(RepositoryEvent::pull_request(number, &self.git_ref, head))
            }
        }
    }
}

/// How runs are executed, shared by `dispatch` and `serve`
#[derive(Debug, Args, Clone)]
pub struct EngineArgs {
    /// Scheduling strategy for the jobs of each run
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::Parallel)]
    pub strategy: SchedulingStrategyArg,

    /// Job limit for the parallel-limited strategy
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Directory the steps run in
    #[arg(long, default_value = ".")]
    pub working_dir: PathBuf,

    /// Shared dependency cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Prefix of the environment variables secrets are read from
    #[arg(long, default_value = "SHIPYARD_SECRET_")]
    pub secret_prefix: String,

    /// Don't save runs to history
    #[arg(long)]
    pub no_history: bool,
}

impl EngineArgs {
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => {
                SchedulingStrategy::LimitedParallel(self.max_parallel.max(1))
            }
        }
    }
}

/// Dispatch an event and run every matching pipeline
#[derive(Debug, Args, Clone)]
pub struct DispatchCommand {
    #[command(flatten)]
    pub event: EventArgs,

    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Read requests from stdin and dispatch them through one governor
#[derive(Debug, Args, Clone)]
pub struct ServeCommand {
    #[command(flatten)]
    pub engine: EngineArgs,
}

/// Show which pipelines an event would trigger
#[derive(Debug, Args, Clone)]
pub struct MatchCommand {
    #[command(flatten)]
    pub event: EventArgs,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Validate a workflow file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to workflow YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines in the run history
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single run with its jobs and steps
    #[arg(long)]
    pub run_id: Option<String>,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}
