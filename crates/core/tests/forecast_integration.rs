//! Integration tests for warmup trace recording and forecast-driven
//! eviction: the full warmup iteration, look-ahead migration in steady
//! state, stat reset/replay, and the post-backward optimizer margin.

use candle_core::DType;
use chunktier_core::testing::{tiny_config, ScriptedProbe};
use chunktier_core::{
    AccessKind, Client, DeviceClass, DeviceTopology, TensorSpec, TrainingStage,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn client_with_probe(accel_total: usize, readings: Vec<usize>) -> Client {
    Client::new(
        tiny_config(10),
        DType::U8,
        DeviceTopology::host_backed(),
        Box::new(ScriptedProbe::new(readings, 0)),
        accel_total,
        1 << 20,
    )
}

fn param(numel: usize) -> TensorSpec {
    TensorSpec {
        shape: vec![numel],
        compute_device: DeviceClass::Accelerator,
        init: None,
    }
}

/// One warmup iteration over two params: access each in turn, one moment per
/// access, then a trailing moment with nothing in compute.
fn run_warmup(client: &mut Client, a: chunktier_core::TensorHandle, b: chunktier_core::TensorHandle) {
    client.set_training_stage(TrainingStage::Warmup);
    client.access(a, AccessKind::Data).unwrap();
    client.tiktac().unwrap();

    client.release(a, AccessKind::Data).unwrap();
    client.access(b, AccessKind::Data).unwrap();
    client.tiktac().unwrap();

    client.release(b, AccessKind::Data).unwrap();
    client.tiktac().unwrap();
    client.end_iteration();
}

// ─── Warmup and look-ahead eviction ──────────────────────────────────────────

#[test]
fn test_lookahead_evicts_before_the_tight_moment() {
    // Accelerator budget 100; chunks are 10 bytes each. The scripted probe
    // makes moment 1 tight: 105 total with 20 bytes of chunks resident
    // leaves 85 bytes of non-chunk usage, so only 15 bytes of chunks fit.
    let mut client = client_with_probe(100, vec![30, 105, 25]);
    let handles = client.register(vec![param(5), param(5)]).unwrap();
    let (a, b) = (handles[0], handles[1]);
    client.start_train();
    run_warmup(&mut client, a, b);

    assert!(!client.is_warmup());
    assert_eq!(client.moment(), 0);
    assert_eq!(client.chunk_memory_used(DeviceClass::Accelerator), 20);

    // Steady state: the clock tick at moment 0 must act on moment 1's
    // recorded pressure and push the least-recently-used chunk out now.
    client.set_training_stage(TrainingStage::Fwd);
    client.tiktac().unwrap();

    assert_eq!(client.moment(), 1);
    assert_eq!(client.resident_device(a).unwrap(), DeviceClass::Cpu);
    assert_eq!(
        client.resident_device(b).unwrap(),
        DeviceClass::Accelerator
    );
    assert!(client.chunk_memory_used(DeviceClass::Accelerator) <= 15);
}

#[test]
fn test_no_eviction_without_forecast_pressure() {
    let mut client = client_with_probe(100, vec![30, 35, 25]);
    let handles = client.register(vec![param(5), param(5)]).unwrap();
    let (a, b) = (handles[0], handles[1]);
    client.start_train();
    run_warmup(&mut client, a, b);

    client.set_training_stage(TrainingStage::Fwd);
    for _ in 0..3 {
        client.tiktac().unwrap();
    }
    // A full iteration later both chunks are still resident.
    assert_eq!(client.moment(), 0);
    assert_eq!(client.chunk_memory_used(DeviceClass::Accelerator), 20);
}

// ─── Always-warmup mode ──────────────────────────────────────────────────────

#[test]
fn test_always_warmup_remeasures_every_iteration() {
    // With always_warmup the trace is discarded at each iteration end, so
    // the per-moment clock keeps recording from 0 instead of tripping over
    // last iteration's samples.
    let mut config = tiny_config(10);
    config.always_warmup = true;
    let mut client = Client::new(
        config,
        DType::U8,
        DeviceTopology::host_backed(),
        Box::new(ScriptedProbe::new(vec![30, 35, 25], 0)),
        100,
        1 << 20,
    );
    let handles = client.register(vec![param(5), param(5)]).unwrap();
    let (a, b) = (handles[0], handles[1]);
    client.start_train();

    for _ in 0..3 {
        run_warmup(&mut client, a, b);
        assert!(client.is_warmup());
        assert_eq!(client.moment(), 0);
    }
}

#[test]
fn test_always_warmup_budget_stays_conservative() {
    // Accelerator budget 20 with warmup_chunk_ratio 0.5: only one 10-byte
    // chunk fits at a time, in every iteration, since the conservative
    // fraction never gives way to a forecast.
    let mut config = tiny_config(10);
    config.always_warmup = true;
    config.warmup_chunk_ratio = 0.5;
    let mut client = Client::new(
        config,
        DType::U8,
        DeviceTopology::host_backed(),
        Box::new(ScriptedProbe::new(vec![0], 0)),
        20,
        1 << 20,
    );
    let handles = client.register(vec![param(5), param(5)]).unwrap();
    let (a, b) = (handles[0], handles[1]);
    client.start_train();

    for _ in 0..2 {
        run_warmup(&mut client, a, b);
        // Accessing b evicted a even though the full budget holds both.
        assert_eq!(client.resident_device(a).unwrap(), DeviceClass::Cpu);
        assert_eq!(
            client.resident_device(b).unwrap(),
            DeviceClass::Accelerator
        );
        assert_eq!(client.chunk_memory_used(DeviceClass::Accelerator), 10);
    }
}

// ─── Reset and replay ────────────────────────────────────────────────────────

#[test]
fn test_aborted_warmup_replays_cleanly() {
    let mut client = client_with_probe(100, vec![30, 99, 30, 35, 25]);
    let handles = client.register(vec![param(5), param(5)]).unwrap();
    let (a, b) = (handles[0], handles[1]);
    client.start_train();

    // Abort partway: two moments recorded, then the iteration is thrown away.
    client.set_training_stage(TrainingStage::Warmup);
    client.access(a, AccessKind::Data).unwrap();
    client.tiktac().unwrap();
    client.tiktac().unwrap();
    client.release(a, AccessKind::Data).unwrap();
    client.reset_memory_stats();

    assert_eq!(client.moment(), 0);
    assert!(client.is_warmup());

    // The replay records a fresh 3-moment trace; forecasting then works
    // without tripping over the aborted samples.
    run_warmup(&mut client, a, b);
    client.set_training_stage(TrainingStage::Fwd);
    for _ in 0..3 {
        client.tiktac().unwrap();
    }
    assert_eq!(client.moment(), 0);
}

// ─── Optimizer margin ────────────────────────────────────────────────────────

#[test]
fn test_margin_counts_optimizer_chunks_after_warmup() {
    // Budget 1000; peak total reading 45 with 20 chunk bytes resident means
    // a 25-byte non-chunk peak. Params hold 20 bytes; chunks are 10 bytes,
    // so optimizer state per chunk is 60 bytes:
    // (1000 - 25 - 20) / 60 * 0.8 = 12 margin chunks.
    let mut client = client_with_probe(1000, vec![30, 45, 25]);
    let handles = client.register(vec![param(5), param(5)]).unwrap();
    let (a, b) = (handles[0], handles[1]);
    client.start_train();
    run_warmup(&mut client, a, b);

    client.update_margin_mem().unwrap();
    assert_eq!(client.margin_chunk_num_for_adam(), 12);
}
