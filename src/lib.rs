/// rayos-pipeline
///
/// Double-buffered GPU compute pipeline scheduler: streams parameterized
/// work items through a fixed graph of compute stages, overlapping host
/// parameter updates, GPU execution, and post-process readback across two
/// rotating configuration slots.

pub mod device;
pub mod dynamic;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod worker;

pub use device::{Command, CpuExecutor, GpuExecutor, MappedBuffer, Submission, Timeline};
pub use dynamic::{DynamicTask, DynamicTaskScheduler};
pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use scheduler::{Scheduler, Task};
pub use stage::{FieldDescriptor, FieldKind, FieldValue, ParamBlock, RetrieveTensorStage, Slot, Stage, StageBase, Tensor, UpdateTensorStage};
