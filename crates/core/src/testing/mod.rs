//! Helpers shared by unit and integration tests. Everything here stays
//! host-only so the full migration path runs without an accelerator.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::config::ChunkConfig;
use crate::device::DeviceClass;
use crate::probe::MemoryProbe;

/// Probe that replays a scripted sequence of accelerator readings, one per
/// call, then repeats the last. CPU readings stay fixed.
pub struct ScriptedProbe {
    accel: RefCell<VecDeque<usize>>,
    last: RefCell<usize>,
    cpu: usize,
}

impl ScriptedProbe {
    pub fn new(accel_readings: Vec<usize>, cpu: usize) -> Self {
        Self {
            accel: RefCell::new(accel_readings.into()),
            last: RefCell::new(0),
            cpu,
        }
    }
}

impl MemoryProbe for ScriptedProbe {
    fn system_used(&self, device: DeviceClass) -> usize {
        match device {
            DeviceClass::Cpu => self.cpu,
            DeviceClass::Accelerator => match self.accel.borrow_mut().pop_front() {
                Some(v) => {
                    *self.last.borrow_mut() = v;
                    v
                }
                None => *self.last.borrow(),
            },
        }
    }
}

/// Config with full budgets and a small chunk size, so tests can reason in
/// single-digit byte counts.
pub fn tiny_config(default_chunk_size: usize) -> ChunkConfig {
    ChunkConfig {
        overall_accel_ratio: 1.0,
        overall_cpu_ratio: 1.0,
        warmup_chunk_ratio: 1.0,
        default_chunk_size,
        world_size: 1,
        ..ChunkConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_probe_replays_then_repeats() {
        let probe = ScriptedProbe::new(vec![5, 9], 2);
        assert_eq!(probe.system_used(DeviceClass::Accelerator), 5);
        assert_eq!(probe.system_used(DeviceClass::Accelerator), 9);
        assert_eq!(probe.system_used(DeviceClass::Accelerator), 9);
        assert_eq!(probe.system_used(DeviceClass::Cpu), 2);
    }
}
