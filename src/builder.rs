//! Consuming builder for [`GameLoop`](crate::GameLoop).

use std::sync::Arc;

use crate::config::{ClockConfig, LoopConfig, TickBufferConfig};
use crate::error::FlowResult;
use crate::flow::messages::FlowPermission;
use crate::telemetry::ViolationObserver;
use crate::{ExecutionMode, GameLoop, NonBlockingFlow, Simulation};

/// The [`GameLoopBuilder`] assembles a [`GameLoop`] from its configurations, the permission set
/// obtained from the flow, a flow and a simulation.
///
/// The clock's nominal FPS is always taken from [`Simulation::fps`].
///
/// # Example
///
/// ```
/// use lockstep_flow::prelude::*;
///
/// struct Counter(i64);
///
/// impl Simulation for Counter {
///     fn tick(&mut self, _ctx: &mut StepContext<'_>, step: Step) -> bool {
///         if step.advances_age {
///             self.0 += 1;
///         }
///         false
///     }
///     fn restore(&mut self, start_point: &StartPoint) -> FlowResult<()> {
///         self.0 = start_point.frame.as_i64();
///         Ok(())
///     }
///     fn scene_mode(&self) -> SceneMode {
///         SceneMode::default()
///     }
///     fn age(&self) -> Age {
///         Age::new(self.0)
///     }
///     fn fps(&self) -> f64 {
///         30.0
///     }
/// }
///
/// #[derive(Default)]
/// struct Loopback(Vec<FlowRequest>);
///
/// impl NonBlockingFlow for Loopback {
///     fn send(&mut self, request: FlowRequest) {
///         self.0.push(request);
///     }
///     fn receive_all(&mut self) -> Vec<FlowMessage> {
///         Vec::new()
///     }
/// }
///
/// let mut game_loop = GameLoopBuilder::new()
///     .with_permission(FlowPermission::active())
///     .with_execution_mode(ExecutionMode::Active)
///     .build(Counter(0), Loopback::default())
///     .unwrap();
/// game_loop.start();
/// game_loop.on_looper_call(1000.0 / 30.0);
/// assert_eq!(game_loop.simulation().0, 1);
/// ```
#[must_use = "GameLoopBuilder must be consumed by calling build()"]
pub struct GameLoopBuilder {
    clock_config: ClockConfig,
    tick_buffer_config: TickBufferConfig,
    loop_config: LoopConfig,
    permission: FlowPermission,
    execution_mode: ExecutionMode,
    /// Optional observer for violations detected by the loop.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl std::fmt::Debug for GameLoopBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            clock_config,
            tick_buffer_config,
            loop_config,
            permission,
            execution_mode,
            violation_observer,
        } = self;

        f.debug_struct("GameLoopBuilder")
            .field("clock_config", clock_config)
            .field("tick_buffer_config", tick_buffer_config)
            .field("loop_config", loop_config)
            .field("permission", permission)
            .field("execution_mode", execution_mode)
            .field("has_violation_observer", &violation_observer.is_some())
            .finish()
    }
}

impl Default for GameLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GameLoopBuilder {
    /// Construct a new builder with all values set to their defaults: a Passive participant with
    /// passive permissions.
    pub fn new() -> Self {
        Self {
            clock_config: ClockConfig::default(),
            tick_buffer_config: TickBufferConfig::default(),
            loop_config: LoopConfig::default(),
            permission: FlowPermission::default(),
            execution_mode: ExecutionMode::Passive,
            violation_observer: None,
        }
    }

    /// Sets the clock configuration. Its `fps` is overridden by [`Simulation::fps`].
    pub fn with_clock_config(mut self, clock_config: ClockConfig) -> Self {
        self.clock_config = clock_config;
        self
    }

    /// Sets the tick log configuration.
    pub fn with_tick_buffer_config(mut self, tick_buffer_config: TickBufferConfig) -> Self {
        self.tick_buffer_config = tick_buffer_config;
        self
    }

    /// Sets the loop configuration.
    pub fn with_loop_config(mut self, loop_config: LoopConfig) -> Self {
        self.loop_config = loop_config;
        self
    }

    /// Sets the permissions obtained when authenticating with the flow.
    pub fn with_permission(mut self, permission: FlowPermission) -> Self {
        self.permission = permission;
        self
    }

    /// Sets the initial role.
    pub fn with_execution_mode(mut self, execution_mode: ExecutionMode) -> Self {
        self.execution_mode = execution_mode;
        self
    }

    /// Sets a violation observer. Without one, violations go to
    /// [`TracingObserver`](crate::telemetry::TracingObserver).
    ///
    /// ```
    /// use lockstep_flow::{GameLoopBuilder, telemetry::CollectingObserver};
    /// use std::sync::Arc;
    ///
    /// let observer = Arc::new(CollectingObserver::new());
    /// let builder = GameLoopBuilder::new().with_violation_observer(observer.clone());
    /// assert!(observer.violations().is_empty());
    /// ```
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.violation_observer = Some(observer);
        self
    }

    /// Consumes the builder to construct a stopped [`GameLoop`].
    ///
    /// # Errors
    /// - Returns [`FlowError::InvalidConfig`](crate::FlowError::InvalidConfig) if any
    ///   configuration is out of range.
    /// - Returns [`FlowError::NotPermitted`](crate::FlowError::NotPermitted) for an Active role
    ///   without write permission.
    pub fn build<S: Simulation, F: NonBlockingFlow>(
        self,
        simulation: S,
        flow: F,
    ) -> FlowResult<GameLoop<S, F>> {
        let clock_config = self.clock_config.with_fps(simulation.fps());
        clock_config.validate()?;
        self.tick_buffer_config.validate()?;
        self.loop_config.validate()?;

        GameLoop::new(
            simulation,
            flow,
            clock_config,
            self.tick_buffer_config,
            self.loop_config,
            self.permission,
            self.execution_mode,
            self.violation_observer,
        )
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
    use crate::error::FlowError;
    use crate::flow::messages::{FlowMessage, FlowRequest};
    use crate::tick::StartPoint;
    use crate::{Age, SceneMode, Step, StepContext};

    struct Fixed(f64);

    impl Simulation for Fixed {
        fn tick(&mut self, _ctx: &mut StepContext<'_>, _step: Step) -> bool {
            false
        }

        fn restore(&mut self, _start_point: &StartPoint) -> FlowResult<()> {
            Ok(())
        }

        fn scene_mode(&self) -> SceneMode {
            SceneMode::default()
        }

        fn age(&self) -> Age {
            Age::new(0)
        }

        fn fps(&self) -> f64 {
            self.0
        }
    }

    struct Null;

    impl NonBlockingFlow for Null {
        fn send(&mut self, _request: FlowRequest) {}

        fn receive_all(&mut self) -> Vec<FlowMessage> {
            Vec::new()
        }
    }

    #[test]
    fn fps_comes_from_the_simulation() {
        let game_loop = GameLoopBuilder::new().build(Fixed(25.0), Null).unwrap();
        assert_eq!(game_loop.clock().fps(), 25.0);
        assert_eq!(game_loop.clock().wait_time(), 40.0);
        assert!(!game_loop.is_running());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let err = GameLoopBuilder::new()
            .with_loop_config(LoopConfig {
                skip_ticks_at_once: 0,
                ..LoopConfig::default()
            })
            .build(Fixed(60.0), Null)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            FlowError::InvalidConfig {
                field: "skip_ticks_at_once",
                ..
            }
        ));
        assert!(GameLoopBuilder::new().build(Fixed(0.0), Null).is_err());
    }

    #[test]
    fn active_role_needs_write_permission() {
        let result = GameLoopBuilder::new()
            .with_execution_mode(ExecutionMode::Active)
            .build(Fixed(60.0), Null);
        assert!(matches!(result, Err(FlowError::NotPermitted { .. })));

        let game_loop = GameLoopBuilder::new()
            .with_permission(FlowPermission::active())
            .with_execution_mode(ExecutionMode::Active)
            .build(Fixed(60.0), Null)
            .unwrap();
        assert_eq!(game_loop.execution_mode(), ExecutionMode::Active);
    }

    #[test]
    fn debug_hides_the_observer() {
        let text = format!("{:?}", GameLoopBuilder::new());
        assert!(text.contains("has_violation_observer: false"));
    }
}
