//! Coordinates the update worker, the GPU execution timeline, and an
//! optional process worker across one or more [`Pipeline`]s.

use crate::device::{GpuExecutor, Submission, Timeline};
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::stage::FieldValue;
use crate::worker::CounterWorker;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::SegQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One unit of work handed to [`Scheduler::schedule`]: which pipeline to
/// route it to (required only when the scheduler holds more than one),
/// the parameters to apply, and an opaque payload carried verbatim to the
/// process callback. `args` is pushed onto `Q_args` unconditionally whenever
/// the scheduler has a `processFn` configured (spec step 4), so it is a
/// plain `A` rather than `Option<A>`: callers whose `A` carries no real
/// information use `A = ()`.
pub struct Task<A> {
    pub pipeline: Option<String>,
    pub params: HashMap<String, FieldValue>,
    pub args: A,
}

impl<A: Default> Task<A> {
    pub fn new(params: HashMap<String, FieldValue>) -> Self {
        Task { pipeline: None, params, args: A::default() }
    }
}

impl<A> Task<A> {
    pub fn with_pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline = Some(name.into());
        self
    }

    pub fn with_args(mut self, args: A) -> Self {
        self.args = args;
        self
    }
}

type UpdateItem = (Arc<Pipeline>, HashMap<String, FieldValue>);

/// Schedules tasks into one or more pipelines and orchestrates processing of
/// their results. Bundles tasks into batch submissions rather than issuing
/// one GPU submission per task.
pub struct Scheduler<A: Send + 'static = ()> {
    executor: Arc<dyn GpuExecutor>,
    pipelines: Vec<(String, Arc<Pipeline>)>,
    pipeline_index: HashMap<String, usize>,
    queue_capacity: usize,
    update_sender: Sender<UpdateItem>,
    update_receiver: Receiver<UpdateItem>,
    args_queue: Option<Arc<SegQueue<A>>>,
    gpu_timeline: Arc<dyn Timeline>,
    update_timeline: Arc<dyn Timeline>,
    process_timeline: Option<Arc<dyn Timeline>>,
    update_worker: CounterWorker,
    process_worker: Option<CounterWorker>,
    total_tasks: AtomicU64,
    destroyed: AtomicBool,
}

impl<A: Send + 'static> Scheduler<A> {
    /// `pipelines` pairs an optional name with a [`Pipeline`]; a name is
    /// mandatory unless there's exactly one pipeline. `queue_capacity == 0`
    /// means `Q_update` is unbounded. `process_fn`, when present, is run on
    /// its own worker thread as `(slot, batch, args)`.
    pub fn new(
        executor: Arc<dyn GpuExecutor>,
        pipelines: Vec<(Option<String>, Pipeline)>,
        queue_capacity: usize,
        process_fn: Option<Arc<dyn Fn(usize, u64, A) + Send + Sync>>,
    ) -> Self {
        let multiple = pipelines.len() > 1;
        let mut named = Vec::with_capacity(pipelines.len());
        for (i, (name, pipeline)) in pipelines.into_iter().enumerate() {
            let name = name.unwrap_or_else(|| {
                if multiple {
                    format!("pipeline{i}")
                } else {
                    "default".to_string()
                }
            });
            named.push((name, Arc::new(pipeline)));
        }
        let mut pipeline_index = HashMap::with_capacity(named.len());
        for (i, (name, _)) in named.iter().enumerate() {
            pipeline_index.insert(name.clone(), i);
        }

        let (update_sender, update_receiver) = if queue_capacity == 0 {
            channel::unbounded::<UpdateItem>()
        } else {
            channel::bounded::<UpdateItem>(queue_capacity)
        };

        let gpu_timeline = executor.new_timeline(0);
        let update_timeline = executor.new_timeline(0);
        let process_timeline = process_fn.as_ref().map(|_| executor.new_timeline(0));
        let args_queue: Option<Arc<SegQueue<A>>> = process_fn.as_ref().map(|_| Arc::new(SegQueue::new()));

        let update_worker = {
            let receiver = update_receiver.clone();
            let gpu_timeline = gpu_timeline.clone();
            let update_timeline = update_timeline.clone();
            CounterWorker::spawn("rayos-pipeline-update", move |n| {
                let Ok((pipeline, params)) = receiver.try_recv() else {
                    log::warn!("update worker woken for task {n} but Q_update was empty");
                    update_timeline.set(n + 1);
                    return;
                };
                pipeline.set_params(&params);
                if n >= 2 {
                    gpu_timeline.wait(n - 1);
                }
                let slot = (n % 2) as usize;
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
                    pipeline.publish(slot);
                }));
                if let Err(err) = result {
                    log::warn!("exception raised while preparing task {n}: {err:?}");
                }
                update_timeline.set(n + 1);
            })
        };

        let process_worker = process_fn.map(|process_fn| {
            let args_queue = args_queue.clone().expect("args queue present when process_fn is set");
            let gpu_timeline = gpu_timeline.clone();
            let process_timeline = process_timeline
                .clone()
                .expect("process timeline present when process_fn is set");
            CounterWorker::spawn("rayos-pipeline-process", move |n| {
                let Some(args) = args_queue.pop() else {
                    log::warn!("process worker woken for task {n} but Q_args was empty");
                    process_timeline.set(n + 1);
                    return;
                };
                gpu_timeline.wait(n + 1);
                let slot = (n % 2) as usize;
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    process_fn(slot, n, args);
                }));
                if let Err(err) = result {
                    log::warn!("exception raised while processing task {n}: {err:?}");
                }
                process_timeline.set(n + 1);
            })
        });

        Scheduler {
            executor,
            pipelines: named,
            pipeline_index,
            queue_capacity,
            update_sender,
            update_receiver,
            args_queue,
            gpu_timeline,
            update_timeline,
            process_timeline,
            update_worker,
            process_worker,
            total_tasks: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn total_tasks(&self) -> u64 {
        self.total_tasks.load(Ordering::Acquire)
    }

    pub fn tasks_scheduled(&self) -> usize {
        self.update_receiver.len()
    }

    pub fn tasks_finished(&self) -> u64 {
        match &self.process_worker {
            Some(worker) => worker.count(),
            None => self.gpu_timeline.get(),
        }
    }

    /// Resolves `requested` against this scheduler's pipelines. Per
    /// spec.md §4.D.2 step 1, a missing name (when the scheduler holds more
    /// than one pipeline) and an unknown name are both non-fatal: the caller
    /// emits a warning and skips that task rather than aborting the batch,
    /// so both cases collapse to `None` here rather than an `Err`.
    fn resolve_pipeline(&self, requested: Option<&str>) -> Option<Arc<Pipeline>> {
        match requested {
            Some(name) => self.pipeline_index.get(name).map(|&i| self.pipelines[i].1.clone()),
            None => {
                if self.pipelines.len() == 1 {
                    Some(self.pipelines[0].1.clone())
                } else {
                    None
                }
            }
        }
    }

    /// Schedules `tasks` onto the pipeline(s), in order, after previously
    /// scheduled submissions. Returns the number of tasks actually
    /// submitted and, if nonzero, a handle to the GPU submission covering
    /// them.
    pub fn schedule(
        &self,
        tasks: impl IntoIterator<Item = Task<A>>,
        timeout: Option<Duration>,
    ) -> Result<(usize, Option<Submission>), PipelineError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::SchedulerDestroyed);
        }

        let mut builder = None;
        let mut n_submitted: usize = 0;

        for task in tasks {
            let pipeline = match self.resolve_pipeline(task.pipeline.as_deref()) {
                Some(p) => p,
                None => {
                    log::warn!(
                        "there is no pipeline {:?} in this scheduler",
                        task.pipeline.as_deref().unwrap_or("<none>")
                    );
                    continue;
                }
            };

            let send_result = match timeout {
                Some(timeout) => self
                    .update_sender
                    .send_timeout((pipeline.clone(), task.params), timeout)
                    .map_err(|_| ()),
                None => self.update_sender.send((pipeline.clone(), task.params)).map_err(|_| ()),
            };
            if send_result.is_err() {
                break;
            }

            if let Some(args_queue) = &self.args_queue {
                args_queue.push(task.args);
            }

            let n = self.total_tasks.load(Ordering::Relaxed);
            let builder = builder.get_or_insert_with(|| self.executor.clone().begin(self.gpu_timeline.clone(), n));
            builder.wait_for(self.gpu_timeline.clone(), n);
            builder.wait_for(self.update_timeline.clone(), n + 1);
            if let Some(process_timeline) = &self.process_timeline {
                if n >= 2 {
                    builder.wait_for(process_timeline.clone(), n - 1);
                }
            }
            let slot = (n % 2) as usize;
            builder.append(pipeline.subroutine(slot).clone());

            self.total_tasks.fetch_add(1, Ordering::Relaxed);
            n_submitted += 1;
        }

        if n_submitted > 0 {
            let submission = builder.expect("builder set once n_submitted > 0").submit();
            debug_assert!(submission.forgettable);

            self.update_worker.advance(n_submitted as u64);
            if let Some(process_worker) = &self.process_worker {
                process_worker.advance(n_submitted as u64);
            }

            return Ok((n_submitted, Some(submission)));
        }

        Ok((0, None))
    }

    /// Blocks until `task` (default: the last scheduled task) has finished.
    /// Waits on `T_process` if a process worker is configured, else on
    /// `T_gpu`. Waiting on a task index that was never scheduled may block
    /// forever.
    pub fn wait(&self, task: Option<u64>) {
        let task = task.unwrap_or_else(|| self.total_tasks());
        match &self.process_timeline {
            Some(tl) => tl.wait(task),
            None => self.gpu_timeline.wait(task),
        }
    }

    pub fn wait_timeout(&self, task: Option<u64>, timeout: Duration) -> bool {
        let task = task.unwrap_or_else(|| self.total_tasks());
        match &self.process_timeline {
            Some(tl) => tl.wait_timeout(task, timeout),
            None => self.gpu_timeline.wait_timeout(task, timeout),
        }
    }

    /// Drains all scheduled work, stops both workers, and marks the
    /// scheduler destroyed. Further [`Scheduler::schedule`] calls fail with
    /// [`PipelineError::SchedulerDestroyed`].
    pub fn destroy(&self) {
        self.wait(None);
        self.update_worker.stop();
        if let Some(worker) = &self.process_worker {
            worker.stop();
        }
        self.destroyed.store(true, Ordering::Release);
    }
}

impl<A: Send + 'static> Drop for Scheduler<A> {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.update_worker.stop();
            if let Some(worker) = &self.process_worker {
                worker.stop();
            }
        }
    }
}
