use super::chunk::ChunkId;

pub type TensorId = u64;

/// Occupancy state of one tensor payload within its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorStatus {
    /// Extent reserved, payload not yet valid.
    Uninit,
    /// Payload valid and resident, not in active use.
    Hold,
    /// Bound to an in-flight operation on the compute device.
    Compute,
    /// Extent reclaimed (only reachable when a chunk's contents are recycled).
    Free,
}

/// Per-tensor bookkeeping. Owned exclusively by the chunk holding the
/// payload; the chunk binding never changes for the tensor's lifetime.
#[derive(Debug)]
pub struct TensorRecord {
    tensor_id: TensorId,
    chunk_id: ChunkId,
    /// Element offset within the chunk payload.
    offset: usize,
    /// Extent in elements.
    numel: usize,
    status: TensorStatus,
    last_touch: usize,
}

impl TensorRecord {
    pub fn new(tensor_id: TensorId, chunk_id: ChunkId, offset: usize, numel: usize) -> Self {
        Self {
            tensor_id,
            chunk_id,
            offset,
            numel,
            status: TensorStatus::Uninit,
            last_touch: 0,
        }
    }

    pub fn tensor_id(&self) -> TensorId {
        self.tensor_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn status(&self) -> TensorStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TensorStatus) {
        self.status = status;
    }

    pub fn last_touch(&self) -> usize {
        self.last_touch
    }

    pub fn touch(&mut self, moment: usize) {
        self.last_touch = moment;
    }
}
