use candle_core::{DType, Device, Tensor};

use super::tensor_record::{TensorId, TensorRecord, TensorStatus};
use crate::device::DeviceClass;
use crate::error::ChunkError;

pub type ChunkId = usize;

/// Aggregate occupancy of a chunk, derived from its member records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Free,
    Hold,
    Compute,
}

/// Fixed-capacity contiguous buffer holding one or more tensor payloads,
/// resident on exactly one device tier at a time.
///
/// The payload is a pre-allocated zeroed 1-D tensor; member tensors are
/// sub-ranges addressed by element offset. Migration copies the whole buffer
/// and is all-or-nothing: the payload handle is only swapped after the copy
/// succeeds, so a failed move leaves the chunk intact on its old device.
pub struct Chunk {
    chunk_id: ChunkId,
    /// Capacity in elements, set at creation and immutable.
    capacity: usize,
    dtype: DType,
    device: DeviceClass,
    payload: Tensor,
    records: Vec<TensorRecord>,
    /// Elements handed out so far.
    used: usize,
    last_touch: usize,
}

impl Chunk {
    pub fn new(
        chunk_id: ChunkId,
        capacity: usize,
        dtype: DType,
        device: DeviceClass,
        concrete: &Device,
    ) -> Result<Self, ChunkError> {
        let payload = Tensor::zeros((capacity,), dtype, concrete)?;
        Ok(Self {
            chunk_id,
            capacity,
            dtype,
            device,
            payload,
            records: Vec::new(),
            used: 0,
            last_touch: 0,
        })
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn bytes(&self) -> usize {
        self.capacity * self.dtype.size_in_bytes()
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    pub fn free_elems(&self) -> usize {
        self.capacity - self.used
    }

    pub fn last_touch(&self) -> usize {
        self.last_touch
    }

    pub fn touch(&mut self, moment: usize) {
        self.last_touch = moment;
    }

    /// Reserve `numel` elements for `tensor_id` and return the offset.
    /// The capacity check lives in `ChunkList::allocate`; the invariant is
    /// re-asserted here.
    pub fn allocate(&mut self, tensor_id: TensorId, numel: usize, moment: usize) -> usize {
        debug_assert!(numel <= self.free_elems(), "chunk overcommit");
        let offset = self.used;
        self.used += numel;
        self.records
            .push(TensorRecord::new(tensor_id, self.chunk_id, offset, numel));
        self.last_touch = moment;
        offset
    }

    pub fn record(&self, tensor_id: TensorId) -> Option<&TensorRecord> {
        self.records.iter().find(|r| r.tensor_id() == tensor_id)
    }

    fn record_mut(&mut self, tensor_id: TensorId) -> Result<&mut TensorRecord, ChunkError> {
        self.records
            .iter_mut()
            .find(|r| r.tensor_id() == tensor_id)
            .ok_or(ChunkError::InvalidAccess { tensor_id })
    }

    pub fn records(&self) -> &[TensorRecord] {
        &self.records
    }

    pub fn set_status(
        &mut self,
        tensor_id: TensorId,
        status: TensorStatus,
        moment: usize,
    ) -> Result<(), ChunkError> {
        let record = self.record_mut(tensor_id)?;
        record.set_status(status);
        record.touch(moment);
        Ok(())
    }

    /// Compute if any member is Compute, else Hold if any member holds a
    /// valid payload, else Free.
    pub fn status(&self) -> ChunkStatus {
        let mut holds = false;
        for record in &self.records {
            match record.status() {
                TensorStatus::Compute => return ChunkStatus::Compute,
                TensorStatus::Hold => holds = true,
                TensorStatus::Uninit | TensorStatus::Free => {}
            }
        }
        if holds {
            ChunkStatus::Hold
        } else {
            ChunkStatus::Free
        }
    }

    /// A 1-D view of the tensor's sub-range, backed by the current payload.
    /// Views become stale after a move; callers re-resolve through here.
    pub fn view_of(&self, tensor_id: TensorId) -> Result<Tensor, ChunkError> {
        let record = self
            .record(tensor_id)
            .ok_or(ChunkError::InvalidAccess { tensor_id })?;
        Ok(self.payload.narrow(0, record.offset(), record.numel())?)
    }

    /// Copy `src` into the tensor's sub-range and mark the record Hold.
    pub fn fill(&mut self, tensor_id: TensorId, src: &Tensor) -> Result<(), ChunkError> {
        let (offset, numel) = {
            let record = self
                .record(tensor_id)
                .ok_or(ChunkError::InvalidAccess { tensor_id })?;
            (record.offset(), record.numel())
        };
        let flat = src.flatten_all()?;
        if flat.elem_count() != numel {
            return Err(ChunkError::Candle(candle_core::Error::Msg(format!(
                "payload extent mismatch: tensor {tensor_id} holds {numel} elements, \
                 source has {}",
                flat.elem_count()
            ))));
        }
        let flat = flat.to_dtype(self.dtype)?.to_device(self.payload.device())?;
        self.payload.slice_set(&flat, 0, offset)?;
        let record = self.record_mut(tensor_id)?;
        if record.status() == TensorStatus::Uninit {
            record.set_status(TensorStatus::Hold);
        }
        Ok(())
    }

    /// Whole-buffer copy to the target tier. The payload handle is replaced
    /// only after a successful copy, so the chunk is never split across two
    /// devices.
    pub fn move_to(&mut self, target: DeviceClass, concrete: &Device) -> Result<(), ChunkError> {
        let moved = self.payload.to_device(concrete)?;
        self.payload = moved;
        self.device = target;
        Ok(())
    }
}
