//! Utility stages that move a host-side tensor on or off the device: no
//! declared parameter block, just a single fixed-size buffer per slot and a
//! command that moves bytes between it and another device buffer or the
//! host.

use super::{FieldValue, Slot, Stage};
use crate::device::{Command, GpuExecutor, MappedBuffer};
use crate::error::PipelineError;
use parking_lot::Mutex;
use std::sync::Arc;

/// A flat, host-owned byte buffer with a declared element stride, standing
/// in for the out-of-scope device tensor type. `view`/`set_view` expose it
/// typed via `bytemuck`, matching the zero-copy `numpy`-style view the
/// original stage offered.
pub struct Tensor {
    bytes: Mutex<Vec<u8>>,
}

impl Tensor {
    pub fn zeroed(len_bytes: usize) -> Self {
        Tensor {
            bytes: Mutex::new(vec![0u8; len_bytes]),
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.lock().len()
    }

    /// Typed snapshot of the tensor's current contents.
    pub fn view<T: bytemuck::Pod>(&self) -> Vec<T> {
        let bytes = self.bytes.lock();
        bytemuck::cast_slice(&bytes).to_vec()
    }

    /// Overwrites the tensor's contents from a typed slice.
    pub fn set_view<T: bytemuck::Pod>(&self, data: &[T]) {
        let mut bytes = self.bytes.lock();
        let src = bytemuck::cast_slice(data);
        bytes.clear();
        bytes.extend_from_slice(src);
    }
}

/// Copies a host [`Tensor`] to a device buffer on `publish`, via
/// [`GpuExecutor::update_tensor`]. No declared parameter block: the tensor
/// bytes themselves are the payload.
pub struct UpdateTensorStage {
    name: String,
    executor: Arc<dyn GpuExecutor>,
    tensor: Arc<Tensor>,
    device: [Arc<dyn MappedBuffer>; 2],
}

impl UpdateTensorStage {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn GpuExecutor>,
        tensor: Arc<Tensor>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let size = tensor.len_bytes() as u64;
        let device = [
            executor
                .new_mapped_buffer(size)
                .map_err(|_| PipelineError::UnsupportedDevice {
                    stage: name.clone(),
                    reason: "tensor upload requires a mapped buffer".into(),
                })?,
            executor
                .new_mapped_buffer(size)
                .map_err(|_| PipelineError::UnsupportedDevice {
                    stage: name.clone(),
                    reason: "tensor upload requires a mapped buffer".into(),
                })?,
        ];
        executor.clear_tensor(&device[0], &[0u8], None, None);
        executor.clear_tensor(&device[1], &[0u8], None, None);
        Ok(UpdateTensorStage { name, executor, tensor, device })
    }

    pub fn tensor(&self) -> &Arc<Tensor> {
        &self.tensor
    }

    /// The stage's slot-`i` device buffer, e.g. for wiring as the `src` of a
    /// downstream [`RetrieveTensorStage`] in the same pipeline.
    pub fn device_buffers(&self) -> &[Arc<dyn MappedBuffer>; 2] {
        &self.device
    }
}

impl Stage for UpdateTensorStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, name: &str) -> Result<FieldValue, PipelineError> {
        Err(PipelineError::UnknownKey {
            stage: self.name.clone(),
            name: name.to_string(),
        })
    }

    fn set(&self, _name: &str, _value: FieldValue) {}

    fn fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn build_commands(&self, _slot: Slot) -> Vec<Command> {
        Vec::new()
    }

    unsafe fn publish(&self, slot: Slot) {
        let bytes = self.tensor.bytes.lock();
        self.executor.update_tensor(&bytes, &self.device[slot]);
    }
}

/// Copies a device buffer (`src`, typically an upstream stage's slot-`i`
/// output buffer) into a host [`Tensor`]. The copy itself runs as a
/// [`GpuExecutor::retrieve_tensor`] command on the execution timeline, so it
/// is ordered after whatever GPU work produced `src`'s contents for that
/// slot when this stage is placed after its producer in a [`crate::Pipeline`];
/// [`RetrieveTensorStage::read_back`] then pulls the result into the host
/// tensor once the timeline has advanced past that command.
pub struct RetrieveTensorStage {
    name: String,
    executor: Arc<dyn GpuExecutor>,
    src: [Arc<dyn MappedBuffer>; 2],
    tensor: Arc<Tensor>,
    device: [Arc<dyn MappedBuffer>; 2],
}

impl RetrieveTensorStage {
    /// `src` is the per-slot device buffer this stage retrieves from —
    /// usually the output of the stage immediately before it in the
    /// pipeline.
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn GpuExecutor>,
        src: [Arc<dyn MappedBuffer>; 2],
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let len_bytes = src[0].len() as u64;
        let device = [
            executor
                .new_mapped_buffer(len_bytes)
                .map_err(|_| PipelineError::UnsupportedDevice {
                    stage: name.clone(),
                    reason: "tensor readback requires a mapped buffer".into(),
                })?,
            executor
                .new_mapped_buffer(len_bytes)
                .map_err(|_| PipelineError::UnsupportedDevice {
                    stage: name.clone(),
                    reason: "tensor readback requires a mapped buffer".into(),
                })?,
        ];
        executor.clear_tensor(&device[0], &[0u8], None, None);
        executor.clear_tensor(&device[1], &[0u8], None, None);
        Ok(RetrieveTensorStage {
            name,
            executor,
            src,
            tensor: Arc::new(Tensor::zeroed(len_bytes as usize)),
            device,
        })
    }

    pub fn tensor(&self) -> &Arc<Tensor> {
        &self.tensor
    }

    /// Pulls the slot-`i` device buffer's current bytes into the host
    /// tensor. Called by the process worker, after waiting on `T_gpu`, never
    /// by `publish`.
    pub fn read_back(&self, slot: Slot) {
        let mut bytes = self.tensor.bytes.lock();
        unsafe {
            self.device[slot].read(&mut bytes);
        }
    }
}

impl Stage for RetrieveTensorStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, name: &str) -> Result<FieldValue, PipelineError> {
        Err(PipelineError::UnknownKey {
            stage: self.name.clone(),
            name: name.to_string(),
        })
    }

    fn set(&self, _name: &str, _value: FieldValue) {}

    fn fields(&self) -> Vec<String> {
        Vec::new()
    }

    fn build_commands(&self, slot: Slot) -> Vec<Command> {
        vec![self.executor.retrieve_tensor(self.src[slot].clone(), self.device[slot].clone())]
    }

    unsafe fn publish(&self, _slot: Slot) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuExecutor;

    #[test]
    fn update_tensor_stage_publishes_bytes_to_slot() {
        let exec = CpuExecutor::new();
        let tensor = Arc::new(Tensor::zeroed(4));
        tensor.set_view::<f32>(&[1.0]);
        let stage = UpdateTensorStage::new("upload", exec.clone(), tensor).unwrap();
        unsafe {
            stage.publish(0);
        }
        let mut out = [0u8; 4];
        unsafe {
            stage.device[0].read(&mut out);
        }
        assert_eq!(f32::from_ne_bytes(out), 1.0);
    }

    #[test]
    fn retrieve_tensor_stage_pulls_from_src_through_build_commands() {
        let exec = CpuExecutor::new();
        let src = [exec.new_mapped_buffer(4).unwrap(), exec.new_mapped_buffer(4).unwrap()];
        unsafe {
            src[1].write(&2.5f32.to_ne_bytes());
        }
        let stage = RetrieveTensorStage::new("download", exec.clone(), src).unwrap();
        for cmd in stage.build_commands(1) {
            cmd.run();
        }
        stage.read_back(1);
        assert_eq!(stage.tensor().view::<f32>(), vec![2.5]);
    }

    #[test]
    fn update_then_retrieve_round_trips_bytes_per_slot() {
        let exec = CpuExecutor::new();
        let input = Arc::new(Tensor::zeroed(8));
        input.set_view::<f32>(&[1.5, -3.0]);

        let update_stage = UpdateTensorStage::new("up", exec.clone(), input.clone()).unwrap();
        let retrieve_stage = RetrieveTensorStage::new(
            "down",
            exec.clone(),
            update_stage.device_buffers().clone(),
        )
        .unwrap();

        for slot in 0..2 {
            unsafe {
                update_stage.publish(slot);
            }
            for cmd in retrieve_stage.build_commands(slot) {
                cmd.run();
            }
            retrieve_stage.read_back(slot);
            assert_eq!(retrieve_stage.tensor().view::<f32>(), input.view::<f32>());
        }
    }
}
