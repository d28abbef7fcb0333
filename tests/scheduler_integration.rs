use rayos_pipeline::device::{Command, CpuExecutor, GpuExecutor, MappedBuffer};
use rayos_pipeline::error::PipelineError;
use rayos_pipeline::{
    FieldDescriptor, FieldKind, FieldValue, ParamBlock, Pipeline, RetrieveTensorStage, Scheduler, Stage, StageBase,
    Task, Tensor, UpdateTensorStage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[repr(C)]
#[derive(Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct LinearParams {
    m: f32,
    b: f32,
    _dummy: i32,
}

impl ParamBlock for LinearParams {
    const FIELDS: &'static [FieldDescriptor] = &[
        FieldDescriptor { name: "m", offset: 0, size: 4, kind: FieldKind::F32 },
        FieldDescriptor { name: "b", offset: 4, size: 4, kind: FieldKind::F32 },
        FieldDescriptor { name: "_dummy", offset: 8, size: 4, kind: FieldKind::I32 },
    ];
}

const N: usize = 256;

/// Writes `out[i] = m*i + b` over a 256-element f32 tensor for the given
/// slot, reading `m`/`b` from the stage's published device buffer.
struct LinearStage {
    base: StageBase,
    out: [Arc<dyn MappedBuffer>; 2],
}

impl LinearStage {
    fn new(executor: &dyn GpuExecutor) -> Self {
        let base = StageBase::new("linear", executor, vec![("params", LinearParams::default())], vec![]).unwrap();
        let out = [
            executor.new_mapped_buffer((N * 4) as u64).unwrap(),
            executor.new_mapped_buffer((N * 4) as u64).unwrap(),
        ];
        LinearStage { base, out }
    }
}

impl Stage for LinearStage {
    fn name(&self) -> &str {
        self.base.name()
    }
    fn get(&self, name: &str) -> Result<FieldValue, PipelineError> {
        self.base.get(name)
    }
    fn set(&self, name: &str, value: FieldValue) {
        self.base.set(name, value)
    }
    fn fields(&self) -> Vec<String> {
        self.base.fields()
    }
    fn build_commands(&self, slot: usize) -> Vec<Command> {
        let params_buf = self.base.device_buffer("params", slot).unwrap();
        let out_buf = self.out[slot].clone();
        vec![Command::new(move || {
            let mut raw = [0u8; 12];
            unsafe {
                params_buf.read(&mut raw);
            }
            let m = f32::from_ne_bytes(raw[0..4].try_into().unwrap());
            let b = f32::from_ne_bytes(raw[4..8].try_into().unwrap());
            let values: Vec<f32> = (0..N as i32).map(|i| m * i as f32 + b).collect();
            unsafe {
                out_buf.write(bytemuck::cast_slice(&values));
            }
        })]
    }
    unsafe fn publish(&self, slot: usize) {
        self.base.publish_blocks(slot);
    }
}

fn params(m: f32, b: f32) -> HashMap<String, FieldValue> {
    let mut p = HashMap::new();
    p.insert("m".to_string(), FieldValue::F32(m));
    p.insert("b".to_string(), FieldValue::F32(b));
    p
}

#[derive(Clone)]
struct ReadSlot(Arc<dyn MappedBuffer>);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn double_buffered_arithmetic_produces_expected_results() {
    init_logging();
    let exec = CpuExecutor::new();
    let stage = Arc::new(LinearStage::new(exec.as_ref()));
    let retrieve = Arc::new(RetrieveTensorStage::new("retrieve", exec.clone(), stage.out.clone()).unwrap());
    let retrieve2 = retrieve.clone();
    let pipeline = Pipeline::new(
        exec.as_ref(),
        vec![(None, stage as Arc<dyn Stage>), (None, retrieve.clone() as Arc<dyn Stage>)],
    )
    .unwrap();

    let results: Arc<Mutex<HashMap<u64, Vec<f32>>>> = Arc::new(Mutex::new(HashMap::new()));
    let results2 = results.clone();
    let process_fn = Arc::new(move |slot: usize, n: u64, _args: ()| {
        retrieve2.read_back(slot);
        let values = retrieve2.tensor().view::<f32>();
        results2.lock().unwrap().insert(n, values);
    });

    let scheduler: Scheduler<()> = Scheduler::new(exec.clone(), vec![(None, pipeline)], 0, Some(process_fn));

    let configs = [(1.0, 50.0), (3.0, 100.0), (5.0, 150.0), (7.0, 200.0), (9.0, 250.0)];
    let tasks: Vec<Task<()>> = configs.iter().map(|(m, b)| Task::new(params(*m, *b))).collect();
    scheduler.schedule(tasks, None).unwrap();
    scheduler.wait(None);

    let results = results.lock().unwrap();
    for (k, (m, b)) in configs.iter().enumerate() {
        let values = &results[&(k as u64)];
        for i in 0..N {
            assert_eq!(values[i], m * i as f32 + b, "task {k} index {i}");
        }
    }
}

#[test]
fn update_and_retrieve_tensor_stages_round_trip_through_the_scheduler() {
    let exec = CpuExecutor::new();
    let input = Arc::new(Tensor::zeroed(N * 4));
    let values: Vec<f32> = (0..N as i32).map(|i| i as f32 * 0.5).collect();
    input.set_view::<f32>(&values);

    let update = Arc::new(UpdateTensorStage::new("upload", exec.clone(), input.clone()).unwrap());
    let retrieve =
        Arc::new(RetrieveTensorStage::new("download", exec.clone(), update.device_buffers().clone()).unwrap());
    let retrieve2 = retrieve.clone();
    let pipeline = Pipeline::new(
        exec.as_ref(),
        vec![(None, update as Arc<dyn Stage>), (None, retrieve.clone() as Arc<dyn Stage>)],
    )
    .unwrap();

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let process_fn = Arc::new(move |slot: usize, n: u64, _args: ()| {
        retrieve2.read_back(slot);
        assert_eq!(retrieve2.tensor().view::<f32>(), values);
        seen2.lock().unwrap().push(n);
    });

    let scheduler: Scheduler<()> = Scheduler::new(exec.clone(), vec![(None, pipeline)], 0, Some(process_fn));

    let tasks: Vec<Task<()>> = (0..4).map(|_| Task::new(HashMap::new())).collect();
    scheduler.schedule(tasks, None).unwrap();
    scheduler.wait(None);

    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[test]
fn multi_pipeline_routing_tracks_each_pipelines_latest_params() {
    let exec = CpuExecutor::new();
    let mut pipelines = Vec::new();
    let mut shared_stages = Vec::new();
    for name in ["p1", "p2", "p3"] {
        let stage = Arc::new(LinearStage::new(exec.as_ref()));
        shared_stages.push((name, stage.clone()));
        let pipeline = Pipeline::new(exec.as_ref(), vec![(None, stage as Arc<dyn Stage>)]).unwrap();
        pipelines.push((Some(name.to_string()), pipeline));
    }

    let scheduler: Scheduler<()> = Scheduler::new(exec.clone(), pipelines, 0, None);

    let mut last_params: HashMap<&str, (f32, f32)> = HashMap::new();
    let mut tasks = Vec::new();
    for k in 0..8 {
        let name = ["p1", "p2", "p3"][k % 3];
        let m = (2 * k + 1) as f32;
        let b = (50 * (k + 1)) as f32;
        last_params.insert(name, (m, b));
        tasks.push(Task::new(params(m, b)).with_pipeline(name));
    }
    let (n, submission) = scheduler.schedule(tasks, None).unwrap();
    assert_eq!(n, 8);
    submission.unwrap().wait();
    scheduler.wait(None);

    assert_eq!(scheduler.total_tasks(), 8);
    for (name, stage) in shared_stages {
        let (expected_m, expected_b) = last_params[name];
        assert_eq!(stage.get("m").unwrap(), FieldValue::F32(expected_m));
        assert_eq!(stage.get("b").unwrap(), FieldValue::F32(expected_b));
    }
}

#[test]
fn unknown_pipeline_is_skipped_without_aborting_the_batch() {
    let exec = CpuExecutor::new();
    let stage1 = Arc::new(LinearStage::new(exec.as_ref()));
    let pipeline1 = Pipeline::new(exec.as_ref(), vec![(None, stage1 as Arc<dyn Stage>)]).unwrap();
    let scheduler: Scheduler<()> =
        Scheduler::new(exec.clone(), vec![(Some("p1".into()), pipeline1)], 0, None);

    let good = Task::new(params(1.0, 2.0)).with_pipeline("p1");
    let bad = Task::new(params(1.0, 2.0)).with_pipeline("p2");
    let (n, _) = scheduler.schedule(vec![good, bad], None).unwrap();
    assert_eq!(n, 1);
    assert_eq!(scheduler.total_tasks(), 1);
}

#[test]
fn process_fn_panics_do_not_stall_the_timeline() {
    let exec = CpuExecutor::new();
    let stage = Arc::new(LinearStage::new(exec.as_ref()));
    let pipeline = Pipeline::new(exec.as_ref(), vec![(None, stage as Arc<dyn Stage>)]).unwrap();

    let process_fn = Arc::new(move |_slot: usize, n: u64, _args: ()| {
        if n % 2 == 0 {
            panic!("synthetic failure on task {n}");
        }
    });
    let scheduler: Scheduler<()> = Scheduler::new(exec.clone(), vec![(None, pipeline)], 0, Some(process_fn));

    let tasks: Vec<Task<()>> = (0..6).map(|_| Task::new(params(1.0, 0.0))).collect();
    scheduler.schedule(tasks, None).unwrap();
    assert!(scheduler.wait_timeout(None, Duration::from_secs(5)));
}

#[test]
fn slot_reuse_never_overlaps_across_publish_gpu_and_process() {
    let exec = CpuExecutor::new();
    let busy = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let overlap = Arc::new(AtomicUsize::new(0));

    struct SlowStage {
        base: StageBase,
        busy: Arc<[AtomicUsize; 2]>,
        overlap: Arc<AtomicUsize>,
    }
    impl Stage for SlowStage {
        fn name(&self) -> &str {
            self.base.name()
        }
        fn get(&self, name: &str) -> Result<FieldValue, PipelineError> {
            self.base.get(name)
        }
        fn set(&self, name: &str, value: FieldValue) {
            self.base.set(name, value)
        }
        fn fields(&self) -> Vec<String> {
            self.base.fields()
        }
        fn build_commands(&self, slot: usize) -> Vec<Command> {
            let busy = self.busy.clone();
            let overlap = self.overlap.clone();
            vec![Command::new(move || {
                if busy[slot].fetch_add(1, Ordering::SeqCst) != 0 {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(200));
                busy[slot].fetch_sub(1, Ordering::SeqCst);
            })]
        }
        unsafe fn publish(&self, slot: usize) {
            if self.busy[slot].fetch_add(1, Ordering::SeqCst) != 0 {
                self.overlap.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(100));
            self.base.publish_blocks(slot);
            self.busy[slot].fetch_sub(1, Ordering::SeqCst);
        }
    }

    let stage = Arc::new(SlowStage {
        base: StageBase::new("slow", exec.as_ref(), vec![("params", LinearParams::default())], vec![]).unwrap(),
        busy: busy.clone(),
        overlap: overlap.clone(),
    });
    let busy2 = busy.clone();
    let overlap2 = overlap.clone();
    let pipeline = Pipeline::new(exec.as_ref(), vec![(None, stage as Arc<dyn Stage>)]).unwrap();

    let process_fn = Arc::new(move |slot: usize, _n: u64, _args: ()| {
        if busy2[slot].fetch_add(1, Ordering::SeqCst) != 0 {
            overlap2.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_micros(200));
        busy2[slot].fetch_sub(1, Ordering::SeqCst);
    });
    let scheduler: Scheduler<()> = Scheduler::new(exec.clone(), vec![(None, pipeline)], 0, Some(process_fn));

    let tasks: Vec<Task<()>> = (0..20).map(|_| Task::new(params(1.0, 0.0))).collect();
    scheduler.schedule(tasks, None).unwrap();
    scheduler.wait(None);

    assert_eq!(overlap.load(Ordering::SeqCst), 0);
}
