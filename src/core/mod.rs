//! Core domain models
//!
//! This module defines the immutable definitions (pipelines, jobs, steps,
//! triggers) and the per-run state machine instances.

pub mod config;
pub mod context;
pub mod job;
pub mod pipeline;
pub mod registry;
pub mod run;
pub mod state;
pub mod step;
pub mod trigger;

pub use context::*;
pub use job::*;
pub use pipeline::*;
pub use registry::*;
pub use run::*;
pub use state::*;
pub use step::*;
pub use trigger::*;
