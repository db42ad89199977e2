use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::{debug, info, warn};

use crate::chunk::{ChunkId, ChunkList, TensorId, TensorStatus};
use crate::config::ChunkConfig;
use crate::device::{DeviceClass, DeviceTopology};
use crate::error::ChunkError;
use crate::manager::{MemoryManager, TrainingStage};
use crate::metronome::Metronome;
use crate::probe::MemoryProbe;

/// Opaque key returned by registration. Integrations keep one per parameter
/// and never see chunk ids or tensor ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorHandle(u64);

/// Which of a parameter's two payloads an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Data,
    Grad,
}

/// Registration request for one parameter tensor.
pub struct TensorSpec {
    pub shape: Vec<usize>,
    /// Tier the tensor must sit on while an operation computes with it.
    pub compute_device: DeviceClass,
    /// Initial data payload. None leaves the extent zeroed.
    pub init: Option<Tensor>,
}

struct HandleEntry {
    data_id: TensorId,
    grad_id: TensorId,
    shape: Vec<usize>,
    compute_device: DeviceClass,
}

/// Process-group collectives, injected by the integration. The default
/// single-process client runs without one and treats collectives as no-ops.
pub trait CollectiveHook {
    fn allreduce(&self, tensor: &Tensor) -> Result<Tensor, ChunkError>;
    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor, ChunkError>;
}

/// Front door of the runtime: owns the chunk storage, the budget manager and
/// the moment clock, and sequences every tensor access through them.
///
/// The access protocol is strict: `access` returns a view valid until the
/// matching `release`; between the two the tensor's chunk is pinned to its
/// device. Views must not be cached across accesses, since any migration in
/// between rebases the payload.
pub struct Client {
    config: ChunkConfig,
    topology: DeviceTopology,
    chunks: ChunkList,
    manager: MemoryManager,
    metronome: Metronome,
    probe: Box<dyn MemoryProbe>,
    collective: Option<Box<dyn CollectiveHook>>,
    handles: HashMap<TensorHandle, HandleEntry>,
    bindings: HashMap<TensorId, ChunkId>,
    dtype: DType,
    next_handle: u64,
    next_tensor_id: TensorId,
}

impl Client {
    pub fn new(
        config: ChunkConfig,
        dtype: DType,
        topology: DeviceTopology,
        probe: Box<dyn MemoryProbe>,
        accel_total_bytes: usize,
        cpu_total_bytes: usize,
    ) -> Self {
        let manager = MemoryManager::new(config.clone(), accel_total_bytes, cpu_total_bytes);
        let chunks = ChunkList::new(config.default_chunk_size, dtype);
        Self {
            config,
            topology,
            chunks,
            manager,
            metronome: Metronome::new(),
            probe,
            collective: None,
            handles: HashMap::new(),
            bindings: HashMap::new(),
            dtype,
            next_handle: 0,
            next_tensor_id: 0,
        }
    }

    pub fn with_collective(mut self, hook: Box<dyn CollectiveHook>) -> Self {
        self.collective = Some(hook);
        self
    }

    /// Register parameters with the chunk store. Each gets a data extent and
    /// a grad extent; extents are packed into chunks in registration order,
    /// so co-registering layers that are used together keeps them in the
    /// same chunk.
    pub fn register(&mut self, specs: Vec<TensorSpec>) -> Result<Vec<TensorHandle>, ChunkError> {
        let mut handles = Vec::with_capacity(specs.len());
        for spec in specs {
            let numel: usize = spec.shape.iter().product();
            let data_id = self.new_tensor(numel)?;
            let grad_id = self.new_tensor(numel)?;

            if let Some(init) = &spec.init {
                let chunk_id = self.binding_of(data_id)?;
                let chunk = self
                    .chunks
                    .get_mut(chunk_id)
                    .ok_or(ChunkError::UnknownChunk { chunk_id })?;
                chunk.fill(data_id, init)?;
            }

            let handle = TensorHandle(self.next_handle);
            self.next_handle += 1;
            self.handles.insert(
                handle,
                HandleEntry {
                    data_id,
                    grad_id,
                    shape: spec.shape,
                    compute_device: spec.compute_device,
                },
            );
            handles.push(handle);
        }
        info!(count = handles.len(), "registered parameters");
        Ok(handles)
    }

    /// Allocate one extent in the chunk store and account any chunk the
    /// allocation had to create.
    fn new_tensor(&mut self, numel: usize) -> Result<TensorId, ChunkError> {
        let tensor_id = self.next_tensor_id;
        self.next_tensor_id += 1;
        let allocation =
            self.chunks
                .allocate(numel, tensor_id, &self.topology, self.metronome.moment())?;
        if let Some(bytes) = allocation.created_bytes {
            self.manager.add(DeviceClass::Cpu, bytes);
        }
        self.bindings.insert(tensor_id, allocation.chunk_id);
        Ok(tensor_id)
    }

    /// Bring the tensor's chunk to its compute device and return a view of
    /// the payload, shaped as registered. The tensor stays pinned (and its
    /// chunk unevictable) until [`release`](Self::release).
    pub fn access(&mut self, handle: TensorHandle, kind: AccessKind) -> Result<Tensor, ChunkError> {
        let (tensor_id, shape, compute_device) = self.resolve(handle, kind)?;
        let chunk_id = self.binding_of(tensor_id)?;

        let (resident, bytes) = {
            let chunk = self
                .chunks
                .get(chunk_id)
                .ok_or(ChunkError::UnknownChunk { chunk_id })?;
            (chunk.device(), chunk.bytes())
        };
        if resident != compute_device {
            self.prepare_device(compute_device, bytes)?;
            self.chunk_move(chunk_id, compute_device)?;
        }

        let moment = self.metronome.moment();
        let chunk = self
            .chunks
            .get_mut(chunk_id)
            .ok_or(ChunkError::UnknownChunk { chunk_id })?;
        chunk.set_status(tensor_id, TensorStatus::Compute, moment)?;
        chunk.touch(moment);
        let view = chunk.view_of(tensor_id)?;
        Ok(view.reshape(shape)?)
    }

    /// End the in-flight use of a tensor. The payload stays valid and
    /// resident but its chunk becomes evictable again. Releasing a tensor
    /// that is not in compute is harmless.
    pub fn release(&mut self, handle: TensorHandle, kind: AccessKind) -> Result<(), ChunkError> {
        let (tensor_id, _, _) = self.resolve(handle, kind)?;
        let chunk_id = self.binding_of(tensor_id)?;
        let moment = self.metronome.moment();
        self.chunks
            .get_mut(chunk_id)
            .ok_or(ChunkError::UnknownChunk { chunk_id })?
            .set_status(tensor_id, TensorStatus::Hold, moment)
    }

    fn resolve(
        &self,
        handle: TensorHandle,
        kind: AccessKind,
    ) -> Result<(TensorId, Vec<usize>, DeviceClass), ChunkError> {
        let entry = self
            .handles
            .get(&handle)
            .ok_or(ChunkError::UnknownHandle { handle: handle.0 })?;
        let tensor_id = match kind {
            AccessKind::Data => entry.data_id,
            AccessKind::Grad => entry.grad_id,
        };
        Ok((tensor_id, entry.shape.clone(), entry.compute_device))
    }

    fn binding_of(&self, tensor_id: TensorId) -> Result<ChunkId, ChunkError> {
        self.bindings
            .get(&tensor_id)
            .copied()
            .ok_or(ChunkError::InvalidAccess { tensor_id })
    }

    /// Ensure `need_bytes` of chunk capacity can sit on `target`, evicting
    /// least-recently-used chunks toward the tier's spill target if needed.
    /// A request beyond the tier's total budget fails without evicting.
    pub fn prepare_device(
        &mut self,
        target: DeviceClass,
        need_bytes: usize,
    ) -> Result<(), ChunkError> {
        let overall = self.manager.overall_mem(target);
        if need_bytes > overall {
            return Err(ChunkError::CapacityExceeded {
                device: target,
                requested: need_bytes,
                budget: overall,
            });
        }
        let free = self.manager.free_chunk_mem(target, &self.metronome)?;
        if free >= need_bytes {
            return Ok(());
        }
        let shortfall = need_bytes - free;
        debug!(?target, need_bytes, free, shortfall, "making room");
        let spill_to = self.topology.evict_target(target)?;
        let victims = self.chunks.make_room(shortfall, target)?;
        for chunk_id in victims {
            self.chunk_move(chunk_id, spill_to)?;
        }
        Ok(())
    }

    /// Migrate one chunk and keep the per-tier accounting in step. A chunk
    /// already on `target` is left alone.
    fn chunk_move(&mut self, chunk_id: ChunkId, target: DeviceClass) -> Result<(), ChunkError> {
        let chunk = self
            .chunks
            .get_mut(chunk_id)
            .ok_or(ChunkError::UnknownChunk { chunk_id })?;
        let source = chunk.device();
        if source == target {
            return Ok(());
        }
        let bytes = chunk.bytes();
        let concrete = self.topology.concrete(target)?.clone();
        chunk.move_to(target, &concrete)?;
        self.manager.delete(source, bytes);
        self.manager.add(target, bytes);
        debug!(chunk_id, ?source, ?target, bytes, "chunk moved");
        Ok(())
    }

    /// Advance the moment clock: record the warmup sample or act on the
    /// forecast, migrating whatever the look-ahead says will not fit at the
    /// next moment. Call once per logical access point, every iteration.
    pub fn tiktac(&mut self) -> Result<(), ChunkError> {
        let victims =
            self.manager
                .tiktac(&mut self.metronome, self.probe.as_ref(), &self.chunks)?;
        if victims.is_empty() {
            return Ok(());
        }
        let spill_to = self.topology.evict_target(DeviceClass::Accelerator)?;
        for chunk_id in victims {
            self.chunk_move(chunk_id, spill_to)?;
        }
        Ok(())
    }

    /// Mark the start of training. Warmup recording begins at the next
    /// `tiktac`; the parameter commitment is whatever the chunk store holds
    /// at this point.
    pub fn start_train(&mut self) {
        let param_chunk_bytes = self.chunks.chunk_memory_used(DeviceClass::Cpu)
            + self.chunks.chunk_memory_used(DeviceClass::Accelerator);
        let default_chunk_bytes = self.config.default_chunk_size * self.dtype.size_in_bytes();
        self.manager
            .start_train(&mut self.metronome, param_chunk_bytes, default_chunk_bytes);
    }

    /// Close the current iteration. The first call freezes the warmup trace
    /// and switches forecasting on. Under `always_warmup` the recorded
    /// samples are discarded instead, so the next iteration measures from
    /// moment 0 again.
    pub fn end_iteration(&mut self) {
        if self.config.always_warmup {
            self.manager.reset_memory_stats(&mut self.metronome);
        } else if self.metronome.is_warmup() {
            info!(
                moments = self.metronome.moment(),
                "warmup complete, forecasting enabled"
            );
            self.metronome.complete_warmup();
        } else {
            self.metronome.rewind();
        }
    }

    pub fn set_training_stage(&mut self, stage: TrainingStage) {
        self.manager.set_training_stage(stage);
    }

    /// Recompute the optimizer-state margin from the recorded peak. Call
    /// after backward of the warmup iteration.
    pub fn update_margin_mem(&mut self) -> Result<(), ChunkError> {
        self.manager.update_margin_mem()
    }

    /// Throw away a partially recorded warmup and replay it from moment 0.
    pub fn reset_memory_stats(&mut self) {
        self.manager.reset_memory_stats(&mut self.metronome);
    }

    /// Allreduce the gradient payload in place across the process group.
    /// Without a collective hook (single process) this is a no-op.
    pub fn allreduce_grad(&mut self, handle: TensorHandle) -> Result<(), ChunkError> {
        let Some(hook) = self.collective.take() else {
            return Ok(());
        };
        let result = (|| {
            let view = self.access(handle, AccessKind::Grad)?;
            let reduced = hook.allreduce(&view)?;
            self.fill_tensor(handle, AccessKind::Grad, &reduced)?;
            self.release(handle, AccessKind::Grad)
        })();
        self.collective = Some(hook);
        result
    }

    /// Broadcast the data payload from `root` to all ranks.
    pub fn broadcast_data(&mut self, handle: TensorHandle, root: usize) -> Result<(), ChunkError> {
        let Some(hook) = self.collective.take() else {
            return Ok(());
        };
        let result = (|| {
            let view = self.access(handle, AccessKind::Data)?;
            let synced = hook.broadcast(&view, root)?;
            self.fill_tensor(handle, AccessKind::Data, &synced)?;
            self.release(handle, AccessKind::Data)
        })();
        self.collective = Some(hook);
        result
    }

    fn fill_tensor(
        &mut self,
        handle: TensorHandle,
        kind: AccessKind,
        src: &Tensor,
    ) -> Result<(), ChunkError> {
        let (tensor_id, _, _) = self.resolve(handle, kind)?;
        let chunk_id = self.binding_of(tensor_id)?;
        self.chunks
            .get_mut(chunk_id)
            .ok_or(ChunkError::UnknownChunk { chunk_id })?
            .fill(tensor_id, src)
    }

    /// Tier the tensor's chunk currently sits on.
    pub fn resident_device(&self, handle: TensorHandle) -> Result<DeviceClass, ChunkError> {
        let (tensor_id, _, _) = self.resolve(handle, AccessKind::Data)?;
        let chunk_id = self.binding_of(tensor_id)?;
        self.chunks
            .get(chunk_id)
            .map(|c| c.device())
            .ok_or(ChunkError::UnknownChunk { chunk_id })
    }

    pub fn moment(&self) -> usize {
        self.metronome.moment()
    }

    pub fn is_warmup(&self) -> bool {
        self.metronome.is_warmup()
    }

    pub fn margin_chunk_num_for_adam(&self) -> usize {
        self.manager.margin_chunk_num_for_adam()
    }

    /// Chunk bytes resident per tier, from the storage layer's view.
    pub fn chunk_memory_used(&self, device: DeviceClass) -> usize {
        self.chunks.chunk_memory_used(device)
    }

    /// Log a one-line residency summary, useful around stage transitions.
    pub fn log_residency(&self) {
        let accel = self.chunks.chunk_memory_used(DeviceClass::Accelerator);
        let cpu = self.chunks.chunk_memory_used(DeviceClass::Cpu);
        if accel + cpu == 0 {
            warn!("no chunks registered");
            return;
        }
        info!(
            accel_bytes = accel,
            cpu_bytes = cpu,
            chunks = self.chunks.len(),
            moment = self.metronome.moment(),
            "chunk residency"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use candle_core::Device;

    fn client(default_chunk_size: usize, accel_total: usize) -> Client {
        let config = ChunkConfig {
            overall_accel_ratio: 1.0,
            overall_cpu_ratio: 1.0,
            warmup_chunk_ratio: 1.0,
            default_chunk_size,
            ..ChunkConfig::default()
        };
        Client::new(
            config,
            DType::U8,
            DeviceTopology::host_backed(),
            Box::new(StaticProbe::default()),
            accel_total,
            1 << 20,
        )
    }

    fn spec(shape: Vec<usize>) -> TensorSpec {
        TensorSpec {
            shape,
            compute_device: DeviceClass::Accelerator,
            init: None,
        }
    }

    #[test]
    fn register_packs_data_and_grad() {
        let mut c = client(64, 1 << 20);
        let handles = c.register(vec![spec(vec![4, 8])]).unwrap();
        assert_eq!(handles.len(), 1);
        // 32 data + 32 grad elements fit one 64-element chunk.
        assert_eq!(c.chunks.len(), 1);
    }

    #[test]
    fn access_migrates_to_compute_device() {
        let mut c = client(64, 1 << 20);
        let h = c.register(vec![spec(vec![8])]).unwrap()[0];
        assert_eq!(c.resident_device(h).unwrap(), DeviceClass::Cpu);

        let view = c.access(h, AccessKind::Data).unwrap();
        assert_eq!(view.dims(), &[8]);
        assert_eq!(c.resident_device(h).unwrap(), DeviceClass::Accelerator);
        c.release(h, AccessKind::Data).unwrap();
    }

    #[test]
    fn access_preserves_initial_payload() {
        let mut c = client(64, 1 << 20);
        let init = Tensor::from_vec(vec![3u8, 1, 4, 1], (2, 2), &Device::Cpu).unwrap();
        let h = c
            .register(vec![TensorSpec {
                shape: vec![2, 2],
                compute_device: DeviceClass::Accelerator,
                init: Some(init),
            }])
            .unwrap()[0];

        let view = c.access(h, AccessKind::Data).unwrap();
        let values: Vec<Vec<u8>> = view.to_vec2().unwrap();
        assert_eq!(values, vec![vec![3, 1], vec![4, 1]]);
    }

    #[test]
    fn unknown_handle_is_rejected_with_handle_value() {
        let mut c = client(64, 1 << 20);
        let err = c.access(TensorHandle(99), AccessKind::Data).unwrap_err();
        match err {
            ChunkError::UnknownHandle { handle } => assert_eq!(handle, 99),
            other => panic!("wrong error variant: {other}"),
        }
    }

    #[test]
    fn release_is_idempotent() {
        let mut c = client(64, 1 << 20);
        let h = c.register(vec![spec(vec![8])]).unwrap()[0];
        c.access(h, AccessKind::Data).unwrap();
        c.release(h, AccessKind::Data).unwrap();
        c.release(h, AccessKind::Data).unwrap();
    }

    #[test]
    fn request_beyond_budget_fails_without_evicting() {
        let mut c = client(8, 16);
        let h = c.register(vec![spec(vec![4])]).unwrap()[0];
        c.access(h, AccessKind::Data).unwrap();

        let err = c
            .prepare_device(DeviceClass::Accelerator, 100)
            .unwrap_err();
        match err {
            ChunkError::CapacityExceeded {
                requested, budget, ..
            } => {
                assert_eq!(requested, 100);
                assert_eq!(budget, 16);
            }
            other => panic!("wrong error variant: {other}"),
        }
        // The resident chunk was not disturbed.
        assert_eq!(c.resident_device(h).unwrap(), DeviceClass::Accelerator);
    }

    #[test]
    fn pinned_chunk_blocks_eviction() {
        // One 8-byte chunk fits the 8-byte accelerator budget. While its
        // tensor is in compute, making room for another chunk must fail.
        let mut c = client(8, 8);
        let a = c.register(vec![spec(vec![4])]).unwrap()[0];
        let b = c.register(vec![spec(vec![4])]).unwrap()[0];
        c.access(a, AccessKind::Data).unwrap();

        let err = c.access(b, AccessKind::Data).unwrap_err();
        assert!(matches!(err, ChunkError::CapacityExceeded { .. }));

        // After release the same access succeeds by evicting the first chunk.
        c.release(a, AccessKind::Data).unwrap();
        c.release(a, AccessKind::Grad).unwrap();
        c.access(b, AccessKind::Data).unwrap();
        assert_eq!(c.resident_device(b).unwrap(), DeviceClass::Accelerator);
        assert_eq!(c.resident_device(a).unwrap(), DeviceClass::Cpu);
    }

    #[test]
    fn collectives_are_noops_without_hook() {
        let mut c = client(64, 1 << 20);
        let h = c.register(vec![spec(vec![8])]).unwrap()[0];
        c.allreduce_grad(h).unwrap();
        c.broadcast_data(h, 0).unwrap();
    }
}
