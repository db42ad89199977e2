//! Chunked tensor storage: fixed-capacity buffers, per-tensor records, and
//! the allocation/eviction logic over the ordered chunk sequence.

mod chunk;
mod chunk_list;
pub(crate) mod tensor_record;

pub use chunk::{Chunk, ChunkId, ChunkStatus};
pub use chunk_list::{ChunkAllocation, ChunkList};
pub use tensor_record::{TensorId, TensorRecord, TensorStatus};
