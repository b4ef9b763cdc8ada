//! Job execution on this worker.
//!
//! - **Admission**: [`Orchestrator`] keeps at most one job active and refuses
//!   new jobs while busy
//! - **Execution**: [`JobRunner`] resolves the job's plugins, downloads and
//!   parses the input graph and runs the algorithm plugin
//! - **Measurements**: [`Meter`] streams measurements to a
//!   [`MeasurementSink`]; successful runs commit them
//!
//! # Execution Flow
//!
//! 1. [`Orchestrator::start_job`] moves the job to `INITIALIZING` and spawns
//!    its task
//! 2. The runner walks `PARSING`, `RUNNING` and optionally
//!    `CALCULATING_METRICS`
//! 3. The orchestrator releases the job, resets the plugin directory and
//!    applies the final state
//!
//! Cancellation kills the plugin process. A plugin that runs out of memory or
//! stack fails its job and makes the worker exit with
//! [`RESOURCE_EXHAUSTED_EXIT_CODE`].

pub mod measurement;
pub mod metrics;
mod orchestrator;
pub mod runner;

pub use measurement::{
    JsonlMeasurementSink, MeasurementSink, MemoryMeasurementSink, Meter,
};
pub use orchestrator::Orchestrator;
pub use runner::{JobRunner, RunOutcome};

/// Exit status of the worker process after a job exhausted memory or stack.
pub const RESOURCE_EXHAUSTED_EXIT_CODE: i32 = 12;
