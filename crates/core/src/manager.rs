use tracing::{debug, info};

use crate::chunk::{ChunkId, ChunkList};
use crate::config::ChunkConfig;
use crate::device::DeviceClass;
use crate::error::ChunkError;
use crate::metronome::Metronome;
use crate::probe::MemoryProbe;

/// Coarse phase of one training iteration. Each stage has a distinct
/// memory-pressure profile, so budget forecasting branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingStage {
    Unstart,
    Warmup,
    Fwd,
    Bwd,
    Adam,
}

/// Scratch reserved on the accelerator during the optimizer stage, in
/// default-chunk payloads. No activations compete with chunks there, but the
/// step itself needs working buffers.
const ADAM_SCRATCH_CHUNKS: usize = 4;

/// Optimizer state per chunk relative to the payload: fp32 master copy plus
/// first and second moment estimates, each twice the fp16 payload width.
const OPTIMIZER_STATE_FACTOR: usize = 6;

/// Per-process memory budgets and the warmup-trace forecaster.
///
/// One instance exists per process (constructed explicitly and passed by
/// reference, never a global). During the warmup iteration it records the
/// non-chunk memory in use at every moment; afterwards those samples are the
/// sole input to forecasting — no live measurement is taken in steady state.
pub struct MemoryManager {
    config: ChunkConfig,
    overall_accel_mem: usize,
    overall_cpu_mem: usize,

    accel_chunk_used: usize,
    cpu_chunk_used: usize,

    // Warmup traces, one sample per moment per tier. `*_sys` is total minus
    // chunk memory, i.e. activations and workspaces.
    accel_used_trace: Vec<usize>,
    accel_chunk_trace: Vec<usize>,
    accel_sys_trace: Vec<usize>,
    cpu_used_trace: Vec<usize>,
    cpu_chunk_trace: Vec<usize>,
    cpu_sys_trace: Vec<usize>,

    started: bool,
    stage: TrainingStage,
    /// Extra accelerator-resident chunks the optimizer stage can afford,
    /// computed after backward from the warmup peak.
    margin_chunk_num_for_adam: usize,
    param_chunk_bytes: usize,
    default_chunk_bytes: usize,
}

impl MemoryManager {
    /// `accel_total_bytes` is the physical capacity of this process's
    /// accelerator; `cpu_total_bytes` the host capacity shared by all local
    /// ranks. The configured ratios carve out this process's budgets.
    pub fn new(config: ChunkConfig, accel_total_bytes: usize, cpu_total_bytes: usize) -> Self {
        let overall_accel_mem = (accel_total_bytes as f64 * config.overall_accel_ratio) as usize;
        let overall_cpu_mem = (cpu_total_bytes as f64 * config.overall_cpu_ratio
            / config.world_size as f64) as usize;
        info!(
            accel_budget = overall_accel_mem,
            cpu_budget = overall_cpu_mem,
            "memory manager initialized"
        );
        Self {
            config,
            overall_accel_mem,
            overall_cpu_mem,
            accel_chunk_used: 0,
            cpu_chunk_used: 0,
            accel_used_trace: Vec::new(),
            accel_chunk_trace: Vec::new(),
            accel_sys_trace: Vec::new(),
            cpu_used_trace: Vec::new(),
            cpu_chunk_trace: Vec::new(),
            cpu_sys_trace: Vec::new(),
            started: false,
            stage: TrainingStage::Unstart,
            margin_chunk_num_for_adam: 0,
            param_chunk_bytes: 0,
            default_chunk_bytes: 0,
        }
    }

    pub fn stage(&self) -> TrainingStage {
        self.stage
    }

    pub fn set_training_stage(&mut self, stage: TrainingStage) {
        self.stage = stage;
        info!(?stage, "entering training stage");
    }

    /// Called once before the first real iteration. `param_chunk_bytes` is
    /// the budget already committed to parameter payload chunks.
    pub fn start_train(
        &mut self,
        metronome: &mut Metronome,
        param_chunk_bytes: usize,
        default_chunk_bytes: usize,
    ) {
        metronome.set_warmup(true);
        self.started = true;
        self.param_chunk_bytes = param_chunk_bytes;
        self.default_chunk_bytes = default_chunk_bytes;
        info!(param_chunk_bytes, default_chunk_bytes, "training started");
    }

    pub fn overall_mem(&self, device: DeviceClass) -> usize {
        match device {
            DeviceClass::Cpu => self.overall_cpu_mem,
            DeviceClass::Accelerator => self.overall_accel_mem,
        }
    }

    /// Chunk-memory accounting, driven by the orchestrator on chunk creation
    /// and migration.
    pub fn add(&mut self, device: DeviceClass, bytes: usize) {
        match device {
            DeviceClass::Cpu => self.cpu_chunk_used += bytes,
            DeviceClass::Accelerator => self.accel_chunk_used += bytes,
        }
    }

    pub fn delete(&mut self, device: DeviceClass, bytes: usize) {
        match device {
            DeviceClass::Cpu => self.cpu_chunk_used = self.cpu_chunk_used.saturating_sub(bytes),
            DeviceClass::Accelerator => {
                self.accel_chunk_used = self.accel_chunk_used.saturating_sub(bytes)
            }
        }
    }

    pub fn used_chunk_mem(&self, device: DeviceClass) -> usize {
        match device {
            DeviceClass::Cpu => self.cpu_chunk_used,
            DeviceClass::Accelerator => self.accel_chunk_used,
        }
    }

    /// The portion of the tier's budget usable for chunk payloads, including
    /// what chunks already occupy.
    ///
    /// Before the warmup trace exists the accelerator answer is a
    /// conservative configured fraction; afterwards FWD/BWD take the more
    /// constrained of the current and next moment (the upcoming step's needs
    /// bind too) minus a communication margin, and Adam gets everything but
    /// a fixed scratch reserve since no activations compete there.
    pub fn available_chunk_mem(
        &self,
        device: DeviceClass,
        metronome: &Metronome,
    ) -> Result<usize, ChunkError> {
        match device {
            DeviceClass::Cpu => Ok(self.overall_cpu_mem),
            DeviceClass::Accelerator => {
                if self.config.always_warmup || metronome.is_warmup() || !self.started {
                    return match self.stage {
                        TrainingStage::Adam => Ok(self.adam_chunk_mem()),
                        _ => Ok((self.overall_accel_mem as f64 * self.config.warmup_chunk_ratio)
                            as usize),
                    };
                }
                match self.stage {
                    TrainingStage::Adam => Ok(self.adam_chunk_mem()),
                    TrainingStage::Fwd | TrainingStage::Bwd => {
                        let cur = metronome.moment();
                        let next = metronome.next_moment();
                        let sys_cur = self.accel_sys_at(cur)?;
                        let sys_next = self.accel_sys_at(next)?;
                        let ava = self
                            .overall_accel_mem
                            .saturating_sub(sys_cur)
                            .min(self.overall_accel_mem.saturating_sub(sys_next));
                        let comm_margin =
                            self.config.world_size * 2 * self.default_chunk_bytes;
                        Ok(ava.saturating_sub(comm_margin))
                    }
                    TrainingStage::Unstart | TrainingStage::Warmup => {
                        Ok((self.overall_accel_mem as f64 * self.config.warmup_chunk_ratio)
                            as usize)
                    }
                }
            }
        }
    }

    /// `available - used`: what could still be brought onto the tier.
    pub fn free_chunk_mem(
        &self,
        device: DeviceClass,
        metronome: &Metronome,
    ) -> Result<usize, ChunkError> {
        let available = self.available_chunk_mem(device, metronome)?;
        let free = available.saturating_sub(self.used_chunk_mem(device));
        debug!(?device, free, moment = metronome.moment(), "free chunk mem");
        Ok(free)
    }

    fn adam_chunk_mem(&self) -> usize {
        self.overall_accel_mem
            .saturating_sub(ADAM_SCRATCH_CHUNKS * self.default_chunk_bytes)
    }

    fn accel_sys_at(&self, moment: usize) -> Result<usize, ChunkError> {
        self.accel_sys_trace
            .get(moment)
            .copied()
            .ok_or(ChunkError::IncompleteTrace {
                recorded: self.accel_sys_trace.len(),
                moment,
            })
    }

    /// Record (warmup) or forecast (steady state), then advance the clock.
    ///
    /// Warmup appends the currently observed non-chunk usage to the
    /// per-moment traces, enforcing that the trace stays exactly one sample
    /// ahead of the moment counter — a shorter or longer trace means the
    /// iteration aborted mid-flight.
    ///
    /// Post-warmup, computes the accelerator headroom at the *next* moment;
    /// when resident chunk memory already exceeds it, victims covering the
    /// deficit are selected for the caller to migrate before that moment
    /// arrives. Look-ahead, not reaction.
    pub fn tiktac(
        &mut self,
        metronome: &mut Metronome,
        probe: &dyn MemoryProbe,
        chunk_list: &ChunkList,
    ) -> Result<Vec<ChunkId>, ChunkError> {
        let mut victims = Vec::new();
        if metronome.is_warmup() {
            let accel_used = probe
                .system_used(DeviceClass::Accelerator)
                .max(self.accel_chunk_used);
            self.accel_used_trace.push(accel_used);
            self.accel_chunk_trace.push(self.accel_chunk_used);
            self.accel_sys_trace
                .push(accel_used - self.accel_chunk_used);

            let cpu_used = probe.system_used(DeviceClass::Cpu);
            self.cpu_used_trace.push(cpu_used);
            self.cpu_chunk_trace.push(self.cpu_chunk_used);
            self.cpu_sys_trace
                .push(cpu_used.saturating_sub(self.cpu_chunk_used));

            let moment = metronome.moment();
            if self.accel_sys_trace.len() != moment + 1 {
                return Err(ChunkError::IncompleteTrace {
                    recorded: self.accel_sys_trace.len(),
                    moment,
                });
            }
        } else {
            let next = metronome.next_moment();
            let sys_next = self.accel_sys_at(next)?;
            let ava_next = self.overall_accel_mem.saturating_sub(sys_next);
            let resident = chunk_list.chunk_memory_used(DeviceClass::Accelerator);
            if resident > ava_next {
                let deficit = resident - ava_next;
                debug!(
                    moment = metronome.moment(),
                    next, deficit, "look-ahead eviction triggered"
                );
                victims = chunk_list.make_room(deficit, DeviceClass::Accelerator)?;
            }
        }
        metronome.tiktac();
        Ok(victims)
    }

    /// After backward: how many extra accelerator chunks the optimizer stage
    /// can afford, from the budget left over the warmup peak and the
    /// parameter commitment, divided by the per-chunk optimizer-state
    /// footprint and damped by the configured ratio.
    pub fn update_margin_mem(&mut self) -> Result<(), ChunkError> {
        let peak_sys = self
            .accel_sys_trace
            .iter()
            .copied()
            .max()
            .ok_or(ChunkError::IncompleteTrace {
                recorded: 0,
                moment: 0,
            })?;
        let margin_mem = self
            .overall_accel_mem
            .saturating_sub(peak_sys + self.param_chunk_bytes);
        let per_chunk_state = OPTIMIZER_STATE_FACTOR * self.default_chunk_bytes;
        self.margin_chunk_num_for_adam = if per_chunk_state == 0 {
            0
        } else {
            (margin_mem as f64 / per_chunk_state as f64 * self.config.margin_use_ratio) as usize
        };
        info!(
            peak_non_chunk = peak_sys,
            param_chunk_bytes = self.param_chunk_bytes,
            margin_mem,
            margin_chunks = self.margin_chunk_num_for_adam,
            "accelerator margin after backward"
        );
        Ok(())
    }

    pub fn margin_chunk_num_for_adam(&self) -> usize {
        self.margin_chunk_num_for_adam
    }

    /// Discard all recorded traces. Used when a warmup iteration aborted
    /// partway (the stats only cover part of the access pattern and must not
    /// feed forecasting); the caller replays warmup from moment 0.
    pub fn reset_memory_stats(&mut self, metronome: &mut Metronome) {
        if metronome.is_warmup() {
            self.accel_used_trace.clear();
            self.accel_chunk_trace.clear();
            self.accel_sys_trace.clear();
            self.cpu_used_trace.clear();
            self.cpu_chunk_trace.clear();
            self.cpu_sys_trace.clear();
            metronome.rewind();
        }
        info!("memory statistics reset");
    }

    /// Number of warmup samples recorded so far.
    pub fn trace_len(&self) -> usize {
        self.accel_sys_trace.len()
    }
}
