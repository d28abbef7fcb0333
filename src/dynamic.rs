//! Second-layer scheduler for open-ended tasks whose batch count may grow
//! in response to their own GPU results (iterative refinement, statistical
//! convergence, and similar adaptive workloads).

use crate::pipeline::Pipeline;
use crate::scheduler::{Scheduler, Task};
use crate::stage::FieldValue;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of open-ended work: some initial number of batches to run, and a
/// callback invoked after each finished batch that may request more.
pub trait DynamicTask: Send + Sync {
    /// Number of batches to schedule before the first call to
    /// [`DynamicTask::process_batch`].
    fn initial_batch_count(&self) -> u64;

    /// Parameters to apply to the pipeline for every batch of this task.
    /// Called once per scheduled batch (the task may look at its own state
    /// to vary them if it implements interior mutability).
    fn params(&self) -> HashMap<String, FieldValue>;

    /// Called after each batch finishes. Returns the number of *additional*
    /// batches to queue (`0` if none).
    fn process_batch(&self, slot: usize) -> u64;
}

struct Inflight {
    remaining: AtomicU64,
}

/// Wraps a [`Scheduler`] whose `processFn` drives
/// [`DynamicTask::process_batch`], re-queuing additional batches as tasks
/// request them and tracking overall completion.
pub struct DynamicTaskScheduler {
    schedule_lock: Mutex<()>,
    scheduler: Arc<Scheduler<DynamicEntry>>,
    inflight: AtomicU64,
    all_finished: Condvar,
    finish_lock: Mutex<()>,
    completed: Mutex<Vec<Arc<dyn DynamicTask>>>,
}

struct DynamicEntry {
    task: Arc<dyn DynamicTask>,
    inflight: Arc<Inflight>,
}

impl DynamicTaskScheduler {
    /// Builds the scheduler. `queue_capacity == 0` means `Q_update` is
    /// unbounded; an unbounded queue is required to guarantee a task's
    /// initial batches all fit in a single internal `schedule` call (see
    /// the design notes on bounded-queue batch scheduling).
    pub fn new(
        executor: Arc<dyn crate::device::GpuExecutor>,
        pipelines: Vec<(Option<String>, Pipeline)>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let process_fn = Arc::new(move |slot: usize, _batch: u64, entry: DynamicEntry| {
                if let Some(this) = weak.upgrade() {
                    this.on_batch_finished(slot, entry);
                }
            });
            let scheduler = Arc::new(Scheduler::new(executor, pipelines, queue_capacity, Some(process_fn)));
            DynamicTaskScheduler {
                schedule_lock: Mutex::new(()),
                scheduler,
                inflight: AtomicU64::new(0),
                all_finished: Condvar::new(),
                finish_lock: Mutex::new(()),
                completed: Mutex::new(Vec::new()),
            }
        })
    }

    fn on_batch_finished(&self, slot: usize, entry: DynamicEntry) {
        let extra = entry.task.process_batch(slot);
        let remaining_before = entry.inflight.remaining.fetch_sub(1, Ordering::AcqRel);
        let mut remaining = remaining_before - 1;
        if extra > 0 {
            entry.inflight.remaining.fetch_add(extra, Ordering::AcqRel);
            remaining += extra;
            self.enqueue_batches(&entry.task, &entry.inflight, extra);
        }
        if remaining == 0 {
            self.completed.lock().push(entry.task.clone());
            if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _guard = self.finish_lock.lock();
                self.all_finished.notify_all();
            }
        }
    }

    fn enqueue_batches(&self, task: &Arc<dyn DynamicTask>, inflight: &Arc<Inflight>, count: u64) {
        let params = task.params();
        let _guard = self.schedule_lock.lock();
        let mut remaining_to_send = count;
        while remaining_to_send > 0 {
            let batch: Vec<Task<DynamicEntry>> = (0..remaining_to_send)
                .map(|_| Task {
                    pipeline: None,
                    params: params.clone(),
                    args: DynamicEntry { task: task.clone(), inflight: inflight.clone() },
                })
                .collect();
            let requested = batch.len() as u64;
            let (n, _) = self
                .scheduler
                .schedule(batch, None)
                .expect("scheduling dynamic task batches");
            remaining_to_send -= n as u64;
            if n as u64 == requested {
                break;
            }
            // Queue was bounded and didn't accept everything in one call;
            // loop until every requested batch has been accepted.
        }
    }

    /// Schedules `task`'s initial batches. May be called concurrently with
    /// the internal process worker re-queuing follow-up batches for other
    /// tasks (serialized by `schedule_lock`).
    pub fn schedule(&self, task: Arc<dyn DynamicTask>) {
        let initial = task.initial_batch_count();
        let inflight = Arc::new(Inflight {
            remaining: AtomicU64::new(initial),
        });
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if initial == 0 {
            self.completed.lock().push(task.clone());
            if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _guard = self.finish_lock.lock();
                self.all_finished.notify_all();
            }
            return;
        }
        self.enqueue_batches(&task, &inflight, initial);
    }

    /// Number of tasks currently in flight (scheduled but not yet finished
    /// all their batches).
    pub fn inflight_count(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    /// Drains and returns every task that has finished all its batches
    /// since the last call.
    pub fn take_completed(&self) -> Vec<Arc<dyn DynamicTask>> {
        std::mem::take(&mut self.completed.lock())
    }

    /// Blocks until every currently in-flight task has finished all its
    /// batches.
    pub fn wait_all(&self) {
        let mut guard = self.finish_lock.lock();
        while self.inflight.load(Ordering::Acquire) > 0 {
            self.all_finished.wait(&mut guard);
        }
    }

    pub fn wait_all_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.finish_lock.lock();
        let deadline = std::time::Instant::now() + timeout;
        while self.inflight.load(Ordering::Acquire) > 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            self.all_finished.wait_for(&mut guard, deadline - now);
        }
        true
    }

    pub fn destroy(&self) {
        self.scheduler.destroy();
    }
}
