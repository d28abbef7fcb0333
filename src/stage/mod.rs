//! Stages: one atomic unit of GPU work with its own double-buffered
//! parameter block(s).

mod tensor;

pub use tensor::{RetrieveTensorStage, Tensor, UpdateTensorStage};

use crate::device::{Command, GpuExecutor, MappedBuffer};
use crate::error::PipelineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Which slot (0 or 1) a double-buffered operation targets.
pub type Slot = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    F32(f32),
    I32(i32),
    U32(u32),
    Bool(bool),
}

impl FieldValue {
    fn write_into(self, bytes: &mut [u8]) {
        match self {
            FieldValue::F32(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::I32(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::U32(v) => bytes.copy_from_slice(&v.to_ne_bytes()),
            FieldValue::Bool(v) => bytes.copy_from_slice(&(v as u8).to_ne_bytes()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    F32,
    I32,
    U32,
    Bool,
}

/// Compile-time description of one field of a [`ParamBlock`]: its byte
/// offset within the struct, its size, and its semantic type. The core
/// copies bytes around using only this table — no runtime reflection.
#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub kind: FieldKind,
}

/// A named, POD, fixed-layout parameter record matching GPU expectations.
///
/// Implementors are `#[repr(C)]` + `bytemuck::Pod` structs; `FIELDS`
/// describes every field by name so `StageBase::get`/`set` can dispatch
/// without per-stage boilerplate.
pub trait ParamBlock: bytemuck::Pod + Send + Sync + Default + 'static {
    const FIELDS: &'static [FieldDescriptor];
}

/// Type-erased access to a [`ParamBlock`]'s bytes and named fields.
trait ErasedParamBlock: Send + Sync {
    fn fields(&self) -> &'static [FieldDescriptor];
    fn bytes(&self) -> &[u8];
    fn get(&self, name: &str) -> Option<FieldValue>;
    fn set(&mut self, name: &str, value: FieldValue) -> bool;
}

struct TypedParamBlock<P: ParamBlock> {
    value: P,
}

impl<P: ParamBlock> ErasedParamBlock for TypedParamBlock<P> {
    fn fields(&self) -> &'static [FieldDescriptor] {
        P::FIELDS
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.value)
    }

    fn get(&self, name: &str) -> Option<FieldValue> {
        let field = P::FIELDS.iter().find(|f| f.name == name)?;
        let bytes = bytemuck::bytes_of(&self.value);
        let slice = &bytes[field.offset..field.offset + field.size];
        Some(match field.kind {
            FieldKind::F32 => FieldValue::F32(f32::from_ne_bytes(slice.try_into().unwrap())),
            FieldKind::I32 => FieldValue::I32(i32::from_ne_bytes(slice.try_into().unwrap())),
            FieldKind::U32 => FieldValue::U32(u32::from_ne_bytes(slice.try_into().unwrap())),
            FieldKind::Bool => FieldValue::Bool(slice[0] != 0),
        })
    }

    fn set(&mut self, name: &str, value: FieldValue) -> bool {
        let Some(field) = P::FIELDS.iter().find(|f| f.name == name) else {
            return false;
        };
        let bytes = bytemuck::bytes_of_mut(&mut self.value);
        let slice = &mut bytes[field.offset..field.offset + field.size];
        value.write_into(slice);
        true
    }
}

/// One declared parameter block: a host-private working copy plus two
/// device-resident, host-mapped buffers (slot 0, slot 1).
struct ParamBlockEntry {
    local: Mutex<Box<dyn ErasedParamBlock>>,
    device: [Arc<dyn MappedBuffer>; 2],
}

/// Common machinery shared by every concrete [`Stage`]: the public key/value
/// surface over declared parameter blocks plus whatever extra keys a
/// concrete stage wants to expose itself.
///
/// Concrete stages embed a `StageBase` and delegate `get`/`set`/`fields` to
/// it, adding their own extras (e.g. `RetrieveTensorStage::view`) on top,
/// exactly the layering `spec.md` describes: "field-level API is a
/// convenience layered on top" of the byte-blob contract.
pub struct StageBase {
    name: String,
    blocks: HashMap<&'static str, ParamBlockEntry>,
    extra_fields: Vec<&'static str>,
}

impl StageBase {
    /// Declares `blocks` (binding name -> initial param block value) against
    /// `executor`, allocating two mapped device buffers per block. Fails
    /// with [`PipelineError::UnsupportedDevice`] if the executor cannot
    /// provide mapped buffers (this can't happen with [`crate::device::CpuExecutor`]
    /// but is surfaced here to document the real-driver failure mode).
    pub fn new<P: ParamBlock>(
        name: impl Into<String>,
        executor: &dyn GpuExecutor,
        blocks: Vec<(&'static str, P)>,
        extra_fields: Vec<&'static str>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let mut map = HashMap::new();
        for (binding, value) in blocks {
            let size = std::mem::size_of::<P>() as u64;
            let device = [
                executor
                    .new_mapped_buffer(size)
                    .map_err(|_| PipelineError::UnsupportedDevice {
                        stage: name.clone(),
                        reason: format!("binding {binding:?} requires a mapped buffer"),
                    })?,
                executor
                    .new_mapped_buffer(size)
                    .map_err(|_| PipelineError::UnsupportedDevice {
                        stage: name.clone(),
                        reason: format!("binding {binding:?} requires a mapped buffer"),
                    })?,
            ];
            // A real mapped device buffer is not guaranteed zeroed on
            // allocation; establish a known starting state explicitly.
            executor.clear_tensor(&device[0], &[0u8], None, None);
            executor.clear_tensor(&device[1], &[0u8], None, None);
            map.insert(
                binding,
                ParamBlockEntry {
                    local: Mutex::new(Box::new(TypedParamBlock { value })),
                    device,
                },
            );
        }
        Ok(StageBase {
            name,
            blocks: map,
            extra_fields,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Public (non-underscore-prefixed) field names across every declared
    /// block, plus `extra_fields`.
    pub fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .blocks
            .values()
            .flat_map(|entry| entry.local.lock().fields().iter().map(|f| f.name.to_string()))
            .chain(self.extra_fields.iter().map(|f| f.to_string()))
            .filter(|name| !name.starts_with('_'))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn get(&self, name: &str) -> Result<FieldValue, PipelineError> {
        for entry in self.blocks.values() {
            if let Some(v) = entry.local.lock().get(name) {
                return Ok(v);
            }
        }
        Err(PipelineError::UnknownKey {
            stage: self.name.clone(),
            name: name.to_string(),
        })
    }

    /// Sets `name` on whichever declared block accepts it. Silently ignored
    /// if no block declares that field.
    pub fn set(&self, name: &str, value: FieldValue) {
        for entry in self.blocks.values() {
            if entry.local.lock().set(name, value) {
                return;
            }
        }
    }

    /// Device buffer for `binding` at `slot`, used by `build_commands` to
    /// reference the slot-local memory a command should read.
    pub fn device_buffer(&self, binding: &str, slot: Slot) -> Option<Arc<dyn MappedBuffer>> {
        self.blocks.get(binding).map(|entry| entry.device[slot].clone())
    }

    /// Copies every declared block's working-copy bytes into its slot-`i`
    /// device buffer.
    ///
    /// # Safety
    /// Unsynchronized with respect to GPU consumption of slot `i`; the
    /// caller (the scheduler's update worker) must guarantee slot `i` is not
    /// concurrently read by the GPU timeline.
    pub unsafe fn publish_blocks(&self, slot: Slot) {
        for entry in self.blocks.values() {
            let local = entry.local.lock();
            entry.device[slot].write(local.bytes());
        }
    }
}

/// An abstract unit of GPU work with its own declared parameter block(s).
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Current value of `name` from the host-private working copy.
    fn get(&self, name: &str) -> Result<FieldValue, PipelineError>;

    /// Updates the host-private working copy. Silently ignored if `name`
    /// isn't declared.
    fn set(&self, name: &str, value: FieldValue);

    /// Public (non-underscore) field names.
    fn fields(&self) -> Vec<String>;

    /// Ordered, immutable command list for slot `i`. Called exactly twice
    /// over the stage's lifetime (once per slot), at pipeline construction.
    fn build_commands(&self, slot: Slot) -> Vec<Command>;

    /// Derives private/computed fields immediately before publish. Default:
    /// no-op.
    fn finalize(&self, _slot: Slot) {}

    /// Calls `finalize(slot)` then copies working copies into the slot-`i`
    /// device buffers.
    ///
    /// # Safety
    /// See [`StageBase::publish_blocks`]: unsynchronized with respect to GPU
    /// consumption of slot `i`.
    unsafe fn publish(&self, slot: Slot);
}
