use std::collections::HashMap;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::ChunkError;

/// Memory tier a chunk can live on. Placement and budgeting speak in tiers;
/// the mapping to concrete devices lives in [`DeviceTopology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    Cpu,
    Accelerator,
}

struct TopologyEntry {
    device: Device,
    /// Where chunks evicted from this tier go. None means this tier is the
    /// end of the line and eviction from it is an error.
    evict_target: Option<DeviceClass>,
}

/// Policy table mapping each tier to its backing device and eviction target.
///
/// Keeping the mapping out of the chunk layer lets tests back both tiers with
/// host memory and run the full migration path on any machine.
#[derive(Default)]
pub struct DeviceTopology {
    entries: HashMap<DeviceClass, TopologyEntry>,
}

impl DeviceTopology {
    /// The production shape: accelerator spills to host, host is terminal.
    pub fn two_tier(accel_device: Device) -> Self {
        Self::default()
            .with_entry(DeviceClass::Cpu, Device::Cpu, None)
            .with_entry(
                DeviceClass::Accelerator,
                accel_device,
                Some(DeviceClass::Cpu),
            )
    }

    /// Both tiers backed by host memory. Migration still exercises the real
    /// copy path, just without an accelerator present.
    pub fn host_backed() -> Self {
        Self::two_tier(Device::Cpu)
    }

    pub fn with_entry(
        mut self,
        class: DeviceClass,
        device: Device,
        evict_target: Option<DeviceClass>,
    ) -> Self {
        self.entries.insert(
            class,
            TopologyEntry {
                device,
                evict_target,
            },
        );
        self
    }

    /// The concrete device backing a tier.
    pub fn concrete(&self, class: DeviceClass) -> Result<&Device, ChunkError> {
        self.entries
            .get(&class)
            .map(|e| &e.device)
            .ok_or(ChunkError::UnsupportedDevice { device: class })
    }

    /// Where evictions from `class` land.
    pub fn evict_target(&self, class: DeviceClass) -> Result<DeviceClass, ChunkError> {
        self.entries
            .get(&class)
            .and_then(|e| e.evict_target)
            .ok_or(ChunkError::UnsupportedDevice { device: class })
    }
}
