//! Shared test utilities for integration tests.

use lockstep_flow::prelude::*;

use super::stubs::{MemoryFlow, MemoryServer, StubSimulation};

/// Nominal rate of [`StubSimulation`].
pub const STUB_FPS: f64 = 50.0;

/// One frame at [`STUB_FPS`], in milliseconds.
pub const FRAME_MS: f64 = 1000.0 / STUB_FPS;

/// Installs a test-writer subscriber once per binary. `RUST_LOG` is honored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A started loop of `mode` around `simulation`, connected to `server`.
#[allow(dead_code)]
pub fn build_loop(
    server: &MemoryServer,
    simulation: StubSimulation,
    mode: ExecutionMode,
    loop_config: LoopConfig,
    buffer_config: TickBufferConfig,
) -> GameLoop<StubSimulation, MemoryFlow> {
    init_tracing();
    let permission = match mode {
        ExecutionMode::Active => FlowPermission::active(),
        ExecutionMode::Passive => FlowPermission::passive(),
    };
    let mut game_loop = GameLoopBuilder::new()
        .with_loop_config(loop_config)
        .with_tick_buffer_config(buffer_config)
        .with_permission(permission)
        .with_execution_mode(mode)
        .build(simulation, server.connect())
        .expect("valid loop configuration");
    game_loop.start();
    game_loop
}

/// A started Passive loop with a fresh [`StubSimulation`].
#[allow(dead_code)]
pub fn passive_loop(
    server: &MemoryServer,
    loop_config: LoopConfig,
    buffer_config: TickBufferConfig,
) -> GameLoop<StubSimulation, MemoryFlow> {
    build_loop(
        server,
        StubSimulation::new(),
        ExecutionMode::Passive,
        loop_config,
        buffer_config,
    )
}

/// A started Active loop with a fresh [`StubSimulation`].
#[allow(dead_code)]
pub fn active_loop(
    server: &MemoryServer,
    loop_config: LoopConfig,
) -> GameLoop<StubSimulation, MemoryFlow> {
    build_loop(
        server,
        StubSimulation::new(),
        ExecutionMode::Active,
        loop_config,
        TickBufferConfig::default(),
    )
}

/// Runs `frames` callbacks of exactly one frame each.
#[allow(dead_code)]
pub fn run_frames(game_loop: &mut GameLoop<StubSimulation, MemoryFlow>, frames: usize) {
    for _ in 0..frames {
        game_loop.on_looper_call(FRAME_MS);
    }
}
