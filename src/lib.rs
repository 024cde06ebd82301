//! shipyard - CI and release orchestration for a single repository

pub mod action;
pub mod cache;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod secrets;

// Re-export commonly used types
pub use action::{ActionCatalog, ActionExecutor, ActionInvocation, ActionOutcome, LocalActionExecutor};
pub use core::{ExecutionStatus, Pipeline, PipelineContext, PipelineRegistry, RepositoryEvent, Run};
pub use execution::{CancelToken, ConcurrencyGovernor, Dispatcher, ExecutionEngine, ExecutionEvent, SchedulingStrategy};
pub use secrets::{EnvSecretStore, MemorySecretStore, SecretStore};
