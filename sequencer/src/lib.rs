//! Observation sequencing for smart telescopes.
//!
//! The scheduler decides *what* to observe and *when*; this crate takes its
//! ordered output and drives a [`TelescopeAdapter`](hardware::telescope::TelescopeAdapter)
//! through each target:
//!
//! - [`target`] - scheduled target input and plan files
//! - [`progress`] - execution state, progress, error log, and final result
//! - [`orchestrator`] - the [`ExecutionOrchestrator`] phase loop

pub mod orchestrator;
pub mod progress;
pub mod target;

pub use orchestrator::{ExecutionOrchestrator, OrchestratorError};
pub use progress::{
    ExecutionError, ExecutionProgress, ExecutionResult, ExecutionState, Phase, TargetOutcome,
    TargetResult,
};
pub use target::{load_plan, ScheduledTarget, Target};
