use serde::{Deserialize, Serialize};

/// Scalar knobs supplied once at construction. No file or wire format is
/// owned here; callers deserialize from wherever their launcher keeps config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Fraction of physical accelerator memory this process may use.
    pub overall_accel_ratio: f64,
    /// Fraction of physical host memory usable across all local ranks.
    pub overall_cpu_ratio: f64,
    /// Fraction of the post-backward margin handed to optimizer-state chunks.
    pub margin_use_ratio: f64,
    /// Fraction of the accelerator budget usable for chunks before the
    /// warmup trace exists (non-chunk usage is unknown until then).
    pub warmup_chunk_ratio: f64,
    /// Default chunk capacity in elements. New chunks are sized
    /// `max(default_chunk_size, requested_extent)`.
    pub default_chunk_size: usize,
    /// Number of peer processes sharing host memory and collective buffers.
    pub world_size: usize,
    /// Treat every iteration as warmup: keep re-measuring instead of
    /// forecasting from the recorded trace.
    pub always_warmup: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            overall_accel_ratio: 0.8,
            overall_cpu_ratio: 0.8,
            margin_use_ratio: 0.8,
            warmup_chunk_ratio: 0.2,
            default_chunk_size: 32 * 1024 * 1024,
            world_size: 1,
            always_warmup: false,
        }
    }
}
