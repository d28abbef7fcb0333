//! Ordered sequence of stages compiled into two reusable submission
//! subroutines, one per slot.

use crate::device::{GpuExecutor, Subroutine};
use crate::error::PipelineError;
use crate::stage::{FieldValue, Slot, Stage};
use std::collections::HashMap;
use std::sync::Arc;

/// A named, ordered sequence of [`Stage`]s with two baked subroutines (one
/// per slot). Stage names are made unique at construction by suffixing a
/// counter on collision, exactly as the original pipeline did: the first
/// stage named `"stage"` keeps that name, the next collision becomes
/// `"stage2"`, and so on.
pub struct Pipeline {
    stages: Vec<(String, Arc<dyn Stage>)>,
    index: HashMap<String, usize>,
    subroutines: [Subroutine; 2],
}

impl Pipeline {
    /// Builds the pipeline and bakes both slot subroutines immediately. Each
    /// stage's `build_commands(slot)` is invoked exactly twice in total
    /// across construction (once per slot), per the contract on
    /// [`Stage::build_commands`].
    pub fn new(
        executor: &dyn GpuExecutor,
        stages: Vec<(Option<String>, Arc<dyn Stage>)>,
    ) -> Result<Self, PipelineError> {
        let mut named = Vec::with_capacity(stages.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        for (name, stage) in stages {
            let base = name.unwrap_or_else(|| stage.name().to_string());
            let unique = match seen.get_mut(&base) {
                None => {
                    seen.insert(base.clone(), 1);
                    base
                }
                Some(count) => {
                    *count += 1;
                    format!("{base}{count}")
                }
            };
            named.push((unique, stage));
        }

        let mut index = HashMap::with_capacity(named.len());
        for (i, (name, _)) in named.iter().enumerate() {
            index.insert(name.clone(), i);
        }

        let pipeline_name = named
            .first()
            .map(|(n, _)| n.clone())
            .unwrap_or_else(|| "<empty>".to_string());

        let mut subroutines = Vec::with_capacity(2);
        for slot in 0..2 {
            let mut commands = Vec::new();
            for (_, stage) in &named {
                commands.extend(stage.build_commands(slot));
            }
            subroutines.push(executor.bake(commands, true));
        }
        let subroutines: [Subroutine; 2] = subroutines.try_into().map_err(|_| {
            PipelineError::BuildFailed {
                pipeline: pipeline_name.clone(),
                reason: "expected exactly two baked slot subroutines".into(),
            }
        })?;

        Ok(Pipeline {
            stages: named,
            index,
            subroutines,
        })
    }

    pub fn stages(&self) -> &[(String, Arc<dyn Stage>)] {
        &self.stages
    }

    pub fn subroutine(&self, slot: Slot) -> &Subroutine {
        &self.subroutines[slot]
    }

    /// Publishes every stage for slot `i`.
    ///
    /// # Safety
    /// Unsynchronized with respect to GPU consumption of slot `i`; see
    /// [`Stage::publish`].
    pub unsafe fn publish(&self, slot: Slot) {
        for (_, stage) in &self.stages {
            stage.publish(slot);
        }
    }

    /// Flat map `"{stage}__{field}"` -> value over every stage's public
    /// fields.
    pub fn get_params(&self) -> HashMap<String, FieldValue> {
        let mut out = HashMap::new();
        for (name, stage) in &self.stages {
            for field in stage.fields() {
                if let Ok(value) = stage.get(&field) {
                    out.insert(format!("{name}__{field}"), value);
                }
            }
        }
        out
    }

    /// Sets parameters across stages. A key containing `"__"` targets a
    /// specific stage (`{name}__{field}`); an unqualified key is applied to
    /// every stage that declares it, skipping those that don't.
    pub fn set_params(&self, params: &HashMap<String, FieldValue>) {
        for (key, value) in params {
            if let Some((stage_name, field)) = key.split_once("__") {
                match self.index.get(stage_name) {
                    Some(&i) => self.stages[i].1.set(field, *value),
                    None => log::warn!("there is no stage {stage_name:?} in this pipeline"),
                }
            } else {
                for (_, stage) in &self.stages {
                    stage.set(key, *value);
                }
            }
        }
    }

    /// Runs the pipeline using slot `i` synchronously, publishing first
    /// unless `publish` is `false`.
    pub fn run(&self, executor: Arc<dyn GpuExecutor>, slot: Slot, publish: bool) {
        self.run_async(executor, slot, publish).wait();
    }

    /// Like [`Pipeline::run`] but returns immediately with a handle the
    /// caller can wait on.
    pub fn run_async(
        &self,
        executor: Arc<dyn GpuExecutor>,
        slot: Slot,
        publish: bool,
    ) -> crate::device::Submission {
        if publish {
            unsafe {
                self.publish(slot);
            }
        }
        let timeline = executor.new_timeline(0);
        let mut builder = executor.begin(timeline, 0);
        builder.append(self.subroutine(slot).clone());
        builder.submit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, CpuExecutor};
    use crate::stage::test_support::LinearParams;
    use crate::stage::{FieldValue, ParamBlock, StageBase};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingStage {
        base: StageBase,
        calls: Arc<AtomicU32>,
    }

    impl CountingStage {
        fn new(name: &str, executor: &dyn GpuExecutor, calls: Arc<AtomicU32>) -> Self {
            CountingStage {
                base: StageBase::new(name, executor, vec![("p", LinearParams::default())], vec![])
                    .unwrap(),
                calls,
            }
        }
    }

    impl Stage for CountingStage {
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
        fn build_commands(&self, _slot: Slot) -> Vec<Command> {
            let calls = self.calls.clone();
            vec![Command::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })]
        }
        unsafe fn publish(&self, slot: Slot) {
            self.base.publish_blocks(slot);
        }
    }

    #[test]
    fn duplicate_stage_names_get_suffixed() {
        let exec = CpuExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let s1 = Arc::new(CountingStage::new("stage", exec.as_ref(), calls.clone()));
        let s2 = Arc::new(CountingStage::new("stage", exec.as_ref(), calls.clone()));
        let pipeline = Pipeline::new(
            exec.as_ref(),
            vec![(None, s1 as Arc<dyn Stage>), (None, s2 as Arc<dyn Stage>)],
        )
        .unwrap();
        let names: Vec<&str> = pipeline.stages().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["stage", "stage2"]);
    }

    #[test]
    fn set_params_routes_by_qualified_and_unqualified_key() {
        let exec = CpuExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let s1 = Arc::new(CountingStage::new("a", exec.as_ref(), calls.clone()));
        let s2 = Arc::new(CountingStage::new("b", exec.as_ref(), calls.clone()));
        let pipeline = Pipeline::new(
            exec.as_ref(),
            vec![(None, s1.clone() as Arc<dyn Stage>), (None, s2.clone() as Arc<dyn Stage>)],
        )
        .unwrap();

        let mut params = HashMap::new();
        params.insert("a__m".to_string(), FieldValue::F32(9.0));
        pipeline.set_params(&params);
        assert_eq!(s1.get("m").unwrap(), FieldValue::F32(9.0));
        assert_eq!(s2.get("m").unwrap(), FieldValue::F32(0.0));

        let mut params2 = HashMap::new();
        params2.insert("b".to_string(), FieldValue::F32(3.0));
        pipeline.set_params(&params2);
        assert_eq!(s1.get("b").unwrap(), FieldValue::F32(3.0));
        assert_eq!(s2.get("b").unwrap(), FieldValue::F32(3.0));
    }

    #[test]
    fn get_params_is_a_no_op_round_trip() {
        let exec = CpuExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(CountingStage::new("a", exec.as_ref(), calls));
        stage.set("m", FieldValue::F32(7.0));
        let pipeline =
            Pipeline::new(exec.as_ref(), vec![(None, stage as Arc<dyn Stage>)]).unwrap();
        let params = pipeline.get_params();
        pipeline.set_params(&params);
        assert_eq!(pipeline.get_params(), params);
    }

    #[test]
    fn run_executes_both_slot_subroutines_independently() {
        let exec = CpuExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let stage = Arc::new(CountingStage::new("a", exec.as_ref(), calls.clone()));
        let pipeline =
            Pipeline::new(exec.as_ref(), vec![(None, stage as Arc<dyn Stage>)]).unwrap();
        pipeline.run(exec.clone(), 0, true);
        pipeline.run(exec.clone(), 1, true);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
