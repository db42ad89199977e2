use thiserror::Error;

use crate::device::DeviceClass;

#[derive(Error, Debug)]
pub enum ChunkError {
    /// A tier cannot satisfy a space request even after evicting every
    /// candidate chunk. `budget` is the space that eviction could free.
    #[error("device {device:?} cannot fit {requested} bytes (evictable: {budget} bytes)")]
    CapacityExceeded {
        device: DeviceClass,
        requested: usize,
        budget: usize,
    },

    /// Operation on a tensor id the storage layer has no record of.
    #[error("no record for tensor {tensor_id}")]
    InvalidAccess { tensor_id: u64 },

    /// Operation through a handle no registration ever produced. Handle ids
    /// and tensor ids advance on separate counters, so this is kept apart
    /// from [`InvalidAccess`](Self::InvalidAccess).
    #[error("no registration for handle {handle}")]
    UnknownHandle { handle: u64 },

    /// Internal chunk id with no backing chunk. Indicates corrupted
    /// bookkeeping rather than caller error.
    #[error("no chunk with id {chunk_id}")]
    UnknownChunk { chunk_id: usize },

    /// The device topology has no entry for the requested tier.
    #[error("no device configured for tier {device:?}")]
    UnsupportedDevice { device: DeviceClass },

    /// Forecasting asked for a moment the warmup trace never covered.
    #[error("warmup trace has {recorded} sample(s), moment {moment} requested")]
    IncompleteTrace { recorded: usize, moment: usize },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
