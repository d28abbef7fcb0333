//! Reference CPU-backed [`GpuExecutor`].
//!
//! Models the GPU execution timeline as a single dedicated background
//! thread that drains queued steps in FIFO order, executing each one's
//! subroutine only after its waits are satisfied and advancing the step's
//! target timeline by one afterwards. This is the same "worker thread
//! advances a monotonic target" shape as [`crate::worker::CounterWorker`],
//! just driven by a channel instead of a counter, because here the work
//! items (subroutines) arrive already in their execution order rather than
//! being indexed `0, 1, 2, ...`.

use super::timeline::{HostTimeline, Timeline};
use super::{GpuStep, GpuExecutor, MappedBuffer, Subroutine, Command};
use crate::error::PipelineError;
use crossbeam::channel::{self, Sender};
use std::sync::Arc;

struct HostBuffer {
    data: Box<[std::sync::atomic::AtomicU8]>,
    handle: u64,
}

// SAFETY: access to the buffer's bytes is externally synchronized by the
// timeline waits the scheduler inserts around every publish/dispatch/
// readback; this mirrors the real contract for device-mapped memory.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl MappedBuffer for HostBuffer {
    fn host_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn device_handle(&self) -> u64 {
        self.handle
    }
}

/// Software reference backend for [`GpuExecutor`].
///
/// Owns one background thread representing the GPU's execution timeline.
/// Dropping the last clone of a `CpuExecutor` stops that thread once any
/// already-queued steps have drained.
pub struct CpuExecutor {
    sender: Sender<GpuStep>,
    next_buffer_handle: std::sync::atomic::AtomicU64,
}

impl CpuExecutor {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = channel::unbounded::<GpuStep>();
        std::thread::Builder::new()
            .name("rayos-pipeline-gpu-timeline".into())
            .spawn(move || {
                for step in receiver {
                    for (timeline, value) in &step.waits {
                        timeline.wait(*value);
                    }
                    step.subroutine.execute();
                    let next = step.advance_timeline.get() + 1;
                    step.advance_timeline.set(next);
                }
            })
            .expect("failed to spawn GPU execution timeline thread");

        Arc::new(CpuExecutor {
            sender,
            next_buffer_handle: std::sync::atomic::AtomicU64::new(1),
        })
    }
}

impl GpuExecutor for CpuExecutor {
    fn new_mapped_buffer(&self, size_bytes: u64) -> Result<Arc<dyn MappedBuffer>, PipelineError> {
        let len = size_bytes as usize;
        let data: Box<[std::sync::atomic::AtomicU8]> =
            (0..len).map(|_| std::sync::atomic::AtomicU8::new(0)).collect();
        let handle = self
            .next_buffer_handle
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(Arc::new(HostBuffer { data, handle }))
    }

    fn new_timeline(&self, initial: u64) -> Arc<dyn Timeline> {
        Arc::new(HostTimeline::new(initial))
    }

    fn bake(&self, commands: Vec<Command>, _simultaneous: bool) -> Subroutine {
        Subroutine::new(commands)
    }

    fn clear_tensor(&self, tensor: &Arc<dyn MappedBuffer>, data: &[u8], size: Option<u64>, offset: Option<u64>) {
        let offset = offset.unwrap_or(0) as usize;
        let len = size.map(|s| s as usize).unwrap_or_else(|| tensor.len().saturating_sub(offset));
        if len == 0 || data.is_empty() {
            return;
        }
        let mut fill = Vec::with_capacity(len);
        while fill.len() < len {
            let remaining = len - fill.len();
            fill.extend_from_slice(&data[..remaining.min(data.len())]);
        }
        unsafe {
            tensor.write_at(offset, &fill);
        }
    }

    fn retrieve_tensor(&self, src: Arc<dyn MappedBuffer>, dst_buffer: Arc<dyn MappedBuffer>) -> Command {
        Command::new(move || {
            let mut bytes = vec![0u8; src.len()];
            unsafe {
                src.read(&mut bytes);
                dst_buffer.write(&bytes);
            }
        })
    }

    fn update_tensor(&self, src_buffer: &[u8], dst_tensor: &Arc<dyn MappedBuffer>) {
        unsafe {
            dst_tensor.write(src_buffer);
        }
    }

    fn submit_steps(&self, steps: Vec<GpuStep>) {
        for step in steps {
            // An unbounded channel to a single consumer thread never blocks
            // the producer and never reorders; this is what gives us the
            // FIFO execution-timeline semantics the waits rely on.
            if self.sender.send(step).is_err() {
                log::warn!("GPU execution timeline thread is gone; dropping submitted step");
            }
        }
    }
}
