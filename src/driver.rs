//! Tokio periodic callback source for [`GameLoop`].
//!
//! A [`GameLoop`] does nothing on its own: something has to call
//! [`GameLoop::on_looper_call`] with the elapsed milliseconds and wait for the returned duration.
//! [`LoopDriver`] does exactly that on a Tokio runtime, measuring elapsed time with
//! [`web_time::Instant`] so the same code runs on wasm targets.
//!
//! The loop is not `Send` (the simulation and the target time function need not be), so drive it
//! from a current-thread runtime or a `LocalSet`.
//!
//! # Example
//!
//! ```no_run
//! use lockstep_flow::prelude::*;
//! use lockstep_flow::LoopDriver;
//! # struct MySim;
//! # impl Simulation for MySim {
//! #     fn tick(&mut self, _: &mut StepContext<'_>, _: Step) -> bool { false }
//! #     fn restore(&mut self, _: &StartPoint) -> FlowResult<()> { Ok(()) }
//! #     fn scene_mode(&self) -> SceneMode { SceneMode::default() }
//! #     fn age(&self) -> Age { Age::new(0) }
//! #     fn fps(&self) -> f64 { 60.0 }
//! # }
//! # struct MyFlow;
//! # impl NonBlockingFlow for MyFlow {
//! #     fn send(&mut self, _: FlowRequest) {}
//! #     fn receive_all(&mut self) -> Vec<FlowMessage> { Vec::new() }
//! # }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let game_loop = GameLoopBuilder::new().build(MySim, MyFlow)?;
//!     let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//!
//!     let mut driver = LoopDriver::new(game_loop);
//!     driver.game_loop_mut().start();
//!     # stop_tx.send(true)?;
//!     driver.run(stop_rx).await;
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flag
//!
//! This module requires the `tokio` feature flag:
//!
//! ```toml
//! [dependencies]
//! lockstep-flow = { version = "0.1", features = ["tokio"] }
//! ```

use tokio::sync::watch;
use web_time::Instant;

use crate::{GameLoop, NonBlockingFlow, Simulation};

/// Calls a [`GameLoop`] at the pace it asks for.
pub struct LoopDriver<S: Simulation, F: NonBlockingFlow> {
    game_loop: GameLoop<S, F>,
    last_call: Option<Instant>,
}

impl<S: Simulation, F: NonBlockingFlow> LoopDriver<S, F> {
    /// Wraps a loop. The loop is not started.
    pub fn new(game_loop: GameLoop<S, F>) -> Self {
        Self {
            game_loop,
            last_call: None,
        }
    }

    /// The driven loop.
    pub fn game_loop(&self) -> &GameLoop<S, F> {
        &self.game_loop
    }

    /// The driven loop, mutably.
    pub fn game_loop_mut(&mut self) -> &mut GameLoop<S, F> {
        &mut self.game_loop
    }

    /// Returns the loop.
    pub fn into_inner(self) -> GameLoop<S, F> {
        self.game_loop
    }

    /// Runs one callback and sleeps for the wait time it returns.
    pub async fn step(&mut self) {
        let now = Instant::now();
        let delta_time = self
            .last_call
            .map_or(0.0, |last| now.duration_since(last).as_secs_f64() * 1000.0);
        self.last_call = Some(now);

        let wait = self.game_loop.on_looper_call(delta_time);
        if wait > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(wait / 1000.0)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    /// Runs callbacks until `done` returns `true`.
    pub async fn run_until(&mut self, mut done: impl FnMut(&GameLoop<S, F>) -> bool) {
        while !done(&self.game_loop) {
            self.step().await;
        }
    }

    /// Runs callbacks until `shutdown` holds `true` or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("loop driver started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                () = self.step() => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }
        tracing::debug!("loop driver stopped");
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::flow::messages::{FlowMessage, FlowPermission, FlowRequest};
    use crate::tick::StartPoint;
    use crate::{
        Age, ExecutionMode, FlowResult, GameLoopBuilder, SceneMode, Step, StepContext,
    };
    use std::time::Duration;

    struct Counter(i64);

    impl Simulation for Counter {
        fn tick(&mut self, _ctx: &mut StepContext<'_>, step: Step) -> bool {
            if step.advances_age {
                self.0 += 1;
            }
            false
        }

        fn restore(&mut self, start_point: &StartPoint) -> FlowResult<()> {
            self.0 = start_point.frame.as_i64();
            Ok(())
        }

        fn scene_mode(&self) -> SceneMode {
            SceneMode::default()
        }

        fn age(&self) -> Age {
            Age::new(self.0)
        }

        fn fps(&self) -> f64 {
            100.0
        }
    }

    #[derive(Default)]
    struct Sink(Vec<FlowRequest>);

    impl NonBlockingFlow for Sink {
        fn send(&mut self, request: FlowRequest) {
            self.0.push(request);
        }

        fn receive_all(&mut self) -> Vec<FlowMessage> {
            Vec::new()
        }
    }

    fn driver() -> LoopDriver<Counter, Sink> {
        let mut game_loop = GameLoopBuilder::new()
            .with_permission(FlowPermission::active())
            .with_execution_mode(ExecutionMode::Active)
            .build(Counter(0), Sink::default())
            .unwrap();
        game_loop.start();
        LoopDriver::new(game_loop)
    }

    #[tokio::test]
    async fn active_loop_advances_in_real_time() {
        let mut driver = driver();
        tokio::time::timeout(
            Duration::from_secs(5),
            driver.run_until(|game_loop| game_loop.simulation().0 >= 3),
        )
        .await
        .unwrap();
        assert!(driver.game_loop().current_age() >= Age::new(3));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut driver = driver();
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), driver.run(stop_rx))
            .await
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);
        tokio::time::timeout(Duration::from_secs(1), driver.run(stop_rx))
            .await
            .unwrap();
    }
}
