//! The boundary the GPU driver wrapper is required to expose.
//!
//! Everything in this module is "downward" from the scheduler's point of
//! view: mapped device buffers, a monotonic timeline primitive, and a
//! builder that chains waits and subroutine submissions onto it. A real
//! integration wires these traits to `ash`/`wgpu`; this crate ships exactly
//! one concrete implementation, [`cpu::CpuExecutor`], a software reference
//! backend used by the test suite and by callers who have no GPU available.

mod cpu;
mod timeline;

pub use cpu::CpuExecutor;
pub use timeline::{HostTimeline, Timeline};

use crate::error::PipelineError;
use std::sync::Arc;

/// A mappable, host-addressable device buffer.
///
/// Stages never read or write through this trait directly; they hold a
/// typed view over the bytes returned by [`MappedBuffer::host_ptr`] /
/// [`MappedBuffer::len`].
pub trait MappedBuffer: Send + Sync {
    /// Host-visible address of the buffer's first byte.
    fn host_ptr(&self) -> *mut u8;
    /// Size of the buffer in bytes.
    fn len(&self) -> usize;
    /// Opaque handle identifying the buffer on the device side (used when
    /// binding it into a command / subroutine).
    fn device_handle(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `data` into the buffer starting at byte 0. Callers must
    /// guarantee the buffer is not concurrently read by the GPU.
    ///
    /// # Safety
    /// The caller must ensure no other thread holds a live reference into
    /// this buffer's memory for the duration of the call.
    unsafe fn write(&self, data: &[u8]) {
        debug_assert!(data.len() <= self.len());
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.host_ptr(), data.len());
    }

    /// Reads the buffer's current contents into `out`.
    ///
    /// # Safety
    /// Same caveat as [`MappedBuffer::write`].
    unsafe fn read(&self, out: &mut [u8]) {
        debug_assert!(out.len() <= self.len());
        std::ptr::copy_nonoverlapping(self.host_ptr(), out.as_mut_ptr(), out.len());
    }

    /// As [`MappedBuffer::write`], but starting at byte `offset` instead of 0.
    ///
    /// # Safety
    /// Same caveat as [`MappedBuffer::write`].
    unsafe fn write_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len());
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.host_ptr().add(offset), data.len());
    }

    /// As [`MappedBuffer::read`], but starting at byte `offset` instead of 0.
    ///
    /// # Safety
    /// Same caveat as [`MappedBuffer::read`].
    unsafe fn read_at(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len());
        std::ptr::copy_nonoverlapping(self.host_ptr().add(offset), out.as_mut_ptr(), out.len());
    }
}

/// One recorded device operation. Subroutines are an ordered, immutable list
/// of these, baked once and replayed on every submission.
///
/// The real driver wrapper would record Vulkan/`wgpu` commands here; the
/// reference [`CpuExecutor`] backend instead stores a boxed closure that
/// performs the equivalent host-side work (a `memcpy` for the tensor utility
/// stages, an arithmetic loop for a compute stage under test).
#[derive(Clone)]
pub struct Command(Arc<dyn Fn() + Send + Sync>);

impl Command {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Command(Arc::new(f))
    }

    pub fn run(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Command(..)")
    }
}

/// An immutable, prebaked list of [`Command`]s, reusable across submissions.
#[derive(Clone)]
pub struct Subroutine {
    commands: Arc<Vec<Command>>,
}

impl Subroutine {
    pub fn new(commands: Vec<Command>) -> Self {
        Subroutine {
            commands: Arc::new(commands),
        }
    }

    pub(crate) fn execute(&self) {
        for cmd in self.commands.iter() {
            cmd.run();
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// A single wait-then-run step queued onto a [`GpuExecutor`]'s execution
/// timeline: wait on a set of `(timeline, value)` pairs, then run the
/// subroutine, then advance `advance_timeline` by one.
pub struct GpuStep {
    pub waits: Vec<(Arc<dyn Timeline>, u64)>,
    pub subroutine: Subroutine,
    pub advance_timeline: Arc<dyn Timeline>,
}

/// Builder that chains waits and subroutine submissions onto a monotonic
/// timeline, mirroring the driver wrapper's submission builder
/// (`begin(timeline, start_value) -> Builder; Builder.wait_for(tl, v);
/// Builder.append(subroutine); Builder.submit() -> Submission`).
pub struct SubmissionBuilder {
    executor: Arc<dyn GpuExecutor>,
    target_timeline: Arc<dyn Timeline>,
    start_value: u64,
    pending_waits: Vec<(Arc<dyn Timeline>, u64)>,
    steps: Vec<GpuStep>,
}

impl SubmissionBuilder {
    pub fn wait_for(&mut self, timeline: Arc<dyn Timeline>, value: u64) -> &mut Self {
        self.pending_waits.push((timeline, value));
        self
    }

    pub fn append(&mut self, subroutine: Subroutine) -> &mut Self {
        let waits = std::mem::take(&mut self.pending_waits);
        self.steps.push(GpuStep {
            waits,
            subroutine,
            advance_timeline: self.target_timeline.clone(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Hands the built steps to the executor's execution timeline. Returns a
    /// [`Submission`] the caller can wait on; the timeline is guaranteed to
    /// reach `start_value + step_count()` once every step has run.
    pub fn submit(self) -> Submission {
        let final_value = self.start_value + self.steps.len() as u64;
        let done = self.target_timeline.clone();
        self.executor.submit_steps(self.steps);
        Submission::new(done, final_value)
    }
}

/// Handle to a batch of steps handed to the GPU execution timeline.
/// `forgettable` is required to be `true`: the caller never needs to keep
/// this handle alive for the work to complete, only to observe it.
pub struct Submission {
    pub forgettable: bool,
    done: Arc<dyn Timeline>,
    final_value: u64,
}

impl Submission {
    pub(crate) fn new(done: Arc<dyn Timeline>, final_value: u64) -> Self {
        Submission {
            forgettable: true,
            done,
            final_value,
        }
    }

    /// Blocks until every step in this submission has completed.
    pub fn wait(&self) {
        self.done.wait(self.final_value);
    }

    pub fn final_step(&self) -> u64 {
        self.final_value
    }
}

/// The GPU driver wrapper's contract, as consumed by this crate's core.
pub trait GpuExecutor: Send + Sync {
    /// Allocates a new mapped, host-addressable buffer of `size_bytes`.
    /// Fails with [`PipelineError::UnsupportedDevice`] if mapped buffers are
    /// not supported.
    fn new_mapped_buffer(&self, size_bytes: u64) -> Result<Arc<dyn MappedBuffer>, PipelineError>;

    /// Creates a new monotonic timeline starting at `initial`.
    fn new_timeline(&self, initial: u64) -> Arc<dyn Timeline>;

    /// Bakes a command list into a reusable [`Subroutine`].
    fn bake(&self, commands: Vec<Command>, simultaneous: bool) -> Subroutine;

    /// Fills `tensor` with repeated copies of `data`, optionally restricted
    /// to `size` bytes starting at `offset` (both default to the whole
    /// buffer). Runs immediately, host-side: used at stage construction to
    /// establish a known starting state, since a real mapped device buffer
    /// is not guaranteed zeroed on allocation.
    fn clear_tensor(&self, tensor: &Arc<dyn MappedBuffer>, data: &[u8], size: Option<u64>, offset: Option<u64>);

    /// Builds a [`Command`] that copies `src`'s current bytes into
    /// `dst_buffer`. Unlike [`GpuExecutor::update_tensor`] this does not run
    /// immediately: it is meant to be placed in a stage's command list so it
    /// runs on the execution timeline, after whatever GPU work produced
    /// `src`'s contents for this slot.
    fn retrieve_tensor(&self, src: Arc<dyn MappedBuffer>, dst_buffer: Arc<dyn MappedBuffer>) -> Command;

    /// Copies `src_buffer`'s bytes into `dst_tensor` immediately, host-side.
    /// Used by a stage's `publish` to push freshly-written parameters (or
    /// tensor contents) onto the device, the same way
    /// [`crate::stage::StageBase::publish_blocks`] does for parameter
    /// blocks.
    fn update_tensor(&self, src_buffer: &[u8], dst_tensor: &Arc<dyn MappedBuffer>);

    /// Starts a new submission builder rooted at `(timeline, start_value)`.
    fn begin(self: Arc<Self>, timeline: Arc<dyn Timeline>, start_value: u64) -> SubmissionBuilder {
        SubmissionBuilder {
            executor: self,
            target_timeline: timeline,
            start_value,
            pending_waits: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Hands a built batch of steps to the execution timeline for in-order
    /// processing. Implemented by the backend; called by
    /// [`SubmissionBuilder::submit`], never directly.
    fn submit_steps(&self, steps: Vec<GpuStep>);
}
