use candle_core::DType;
use tracing::debug;

use super::chunk::{Chunk, ChunkId, ChunkStatus};
use super::tensor_record::TensorId;
use crate::device::{DeviceClass, DeviceTopology};
use crate::error::ChunkError;

/// Where freshly created chunks live until first access pulls them in.
const DEFAULT_ALLOC_TIER: DeviceClass = DeviceClass::Cpu;

/// Outcome of an allocation: the owning chunk, the element offset within it,
/// and the byte size of a newly created chunk (None when an existing chunk
/// had room).
pub struct ChunkAllocation {
    pub chunk_id: ChunkId,
    pub offset: usize,
    pub created_bytes: Option<usize>,
}

/// Append-only ordered sequence of chunks. Ids increase monotonically and
/// are never reused; chunks are never deleted, only migrated.
pub struct ChunkList {
    chunks: Vec<Chunk>,
    default_chunk_size: usize,
    dtype: DType,
}

impl ChunkList {
    pub fn new(default_chunk_size: usize, dtype: DType) -> Self {
        Self {
            chunks: Vec::new(),
            default_chunk_size,
            dtype,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, chunk_id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(chunk_id)
    }

    pub fn get_mut(&mut self, chunk_id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(chunk_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Find a chunk with `numel` spare elements, scanning in id order, or
    /// create one sized `max(default_chunk_size, numel)` on the default
    /// tier. Registers a record for `tensor_id` in the chosen chunk.
    pub fn allocate(
        &mut self,
        numel: usize,
        tensor_id: TensorId,
        topology: &DeviceTopology,
        moment: usize,
    ) -> Result<ChunkAllocation, ChunkError> {
        for chunk in self.chunks.iter_mut() {
            if chunk.free_elems() >= numel {
                let offset = chunk.allocate(tensor_id, numel, moment);
                return Ok(ChunkAllocation {
                    chunk_id: chunk.chunk_id(),
                    offset,
                    created_bytes: None,
                });
            }
        }

        let chunk_id = self.chunks.len();
        let capacity = self.default_chunk_size.max(numel);
        let concrete = topology.concrete(DEFAULT_ALLOC_TIER)?;
        let mut chunk = Chunk::new(chunk_id, capacity, self.dtype, DEFAULT_ALLOC_TIER, concrete)?;
        let offset = chunk.allocate(tensor_id, numel, moment);
        let created_bytes = chunk.bytes();
        debug!(
            chunk_id,
            capacity, "created chunk for tensor {tensor_id} ({numel} elems)"
        );
        self.chunks.push(chunk);
        Ok(ChunkAllocation {
            chunk_id,
            offset,
            created_bytes: Some(created_bytes),
        })
    }

    /// Select eviction victims on `device` totaling at least `need_bytes` of
    /// capacity, least-recently-touched first. Chunks serving an active
    /// computation are never candidates. Selection only; the caller migrates.
    pub fn make_room(
        &self,
        need_bytes: usize,
        device: DeviceClass,
    ) -> Result<Vec<ChunkId>, ChunkError> {
        let mut candidates: Vec<&Chunk> = self
            .chunks
            .iter()
            .filter(|c| c.device() == device && c.status() != ChunkStatus::Compute)
            .collect();
        candidates.sort_by_key(|c| (c.last_touch(), c.chunk_id()));

        let mut victims = Vec::new();
        let mut freed = 0usize;
        for chunk in &candidates {
            if freed >= need_bytes {
                break;
            }
            victims.push(chunk.chunk_id());
            freed += chunk.bytes();
        }
        if freed < need_bytes {
            return Err(ChunkError::CapacityExceeded {
                device,
                requested: need_bytes,
                budget: freed,
            });
        }
        debug!(
            ?device,
            need_bytes, freed, "make_room selected {} victim chunk(s)", victims.len()
        );
        Ok(victims)
    }

    /// Sum of capacities of chunks currently resident on `device`, in bytes.
    pub fn chunk_memory_used(&self, device: DeviceClass) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.device() == device)
            .map(|c| c.bytes())
            .sum()
    }
}
