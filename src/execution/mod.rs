//! Run execution: dispatch, concurrency governance, job scheduling

pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod governor;
pub mod scheduler;

pub use dispatcher::{Dispatcher, RunHandle};
pub use engine::{EventBus, EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::{ExecutionResult, StepExecutor};
pub use governor::{Admission, CancelToken, ConcurrencyGovernor, Permit};
pub use scheduler::{ExecutionScheduler, SchedulePlan, SchedulingStrategy};
