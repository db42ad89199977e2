//! Chunk-based two-tier memory management for large-model training.
//!
//! Parameter tensors live inside fixed-capacity chunks that migrate whole
//! between host and accelerator memory under per-tier budgets. A warmup
//! iteration records the non-chunk memory in use at every access point;
//! subsequent iterations replay that trace to evict chunks ahead of demand
//! instead of reacting to allocation failures.
//!
//! [`client::Client`] is the entry point; everything else supports it.

pub mod chunk;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod metronome;
pub mod probe;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use client::{AccessKind, Client, CollectiveHook, TensorHandle, TensorSpec};
pub use config::ChunkConfig;
pub use device::{DeviceClass, DeviceTopology};
pub use error::ChunkError;
pub use manager::TrainingStage;
pub use probe::{MemoryProbe, StaticProbe};
