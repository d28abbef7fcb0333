//! The crate's single error type.
//!
//! Every variant here corresponds to one row of the error table in the
//! scheduler design: most propagate to the caller, a few (`UnknownPipeline`,
//! `UserCallbackFailure`) are deliberately swallowed into a `log::warn!` by
//! the code that can observe them and never reach this type at all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Stage construction requires a mapped device buffer and the executor
    /// could not provide one.
    #[error("device does not support mapped buffers for stage {stage:?}: {reason}")]
    UnsupportedDevice { stage: String, reason: String },

    /// `Stage::get` was called with a name that isn't declared on the stage.
    #[error("unknown parameter {name:?} on stage {stage:?}")]
    UnknownKey { stage: String, name: String },

    /// Any `Scheduler::schedule` call after `Scheduler::destroy`.
    #[error("scheduler has already been destroyed")]
    SchedulerDestroyed,

    /// A task could not be resolved to `(pipeline_name?, params, args?)`.
    /// `Task<A>` is already typed this way, so nothing in this crate raises
    /// it today; reserved for callers that build tasks from a looser,
    /// dynamically-shaped source (e.g. deserialized input) and need a
    /// matching failure mode.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// `Pipeline::build_commands` failed during `Pipeline::new`.
    #[error("failed to bake pipeline {pipeline:?}: {reason}")]
    BuildFailed { pipeline: String, reason: String },
}
