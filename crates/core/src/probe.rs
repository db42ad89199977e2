use crate::device::DeviceClass;

/// Measurement seam for system memory usage. Warmup reads through this once
/// per moment per device class; steady-state training never measures again.
///
/// Implementations report total bytes in use on the tier, including chunk
/// payloads; the manager subtracts its own chunk accounting to isolate
/// non-chunk (activation/workspace) usage.
pub trait MemoryProbe {
    fn system_used(&self, device: DeviceClass) -> usize;
}

/// Fixed readings, one per tier. Useful when an integration supplies its own
/// measurements out of band, and as the trivial probe in examples and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe {
    pub accel_used: usize,
    pub cpu_used: usize,
}

impl MemoryProbe for StaticProbe {
    fn system_used(&self, device: DeviceClass) -> usize {
        match device {
            DeviceClass::Accelerator => self.accel_used,
            DeviceClass::Cpu => self.cpu_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_probe_reports_per_tier() {
        let probe = StaticProbe {
            accel_used: 10,
            cpu_used: 20,
        };
        assert_eq!(probe.system_used(DeviceClass::Accelerator), 10);
        assert_eq!(probe.system_used(DeviceClass::Cpu), 20);
    }
}
