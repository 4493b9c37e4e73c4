//! The frame-driven state machine that decides, once per frame notification, how many ticks to
//! apply to the simulation.
//!
//! Each external callback runs through [`GameLoop::on_looper_call`]: the flow is polled, the
//! [`Clock`] fires zero or more frame notifications, and the requests queued during those frames
//! are flushed back to the flow. Per frame the loop computes a target (the latest known age, an
//! explicit age, or a target time), and from the gap between target and cursor decides whether
//! to wait, step once, catch up in the skip state, or jump to a start point.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::clock::{Clock, FrameArgs};
use crate::config::{ClockConfig, LoopConfig, TickBufferConfig};
use crate::error::{FlowError, FlowResult};
use crate::event::Event;
use crate::event_buffer::{EventBuffer, EventBufferMode};
use crate::flow::messages::{FlowMessage, FlowPermission, FlowRequest, StartPointQuery};
use crate::signal::Signal;
use crate::storage::{LoaderId, StorageKey, StoragePutOption, StorageValue};
use crate::telemetry::{ViolationKind, ViolationObserver, ViolationSeverity};
use crate::tick::{SnapshotData, StartPoint, StartPointData};
use crate::ticks::tick_controller::{ControllerEvent, TickController};
use crate::{
    Age, ExecutionMode, LoopMode, NonBlockingFlow, SceneLocalMode, SceneMode, Simulation,
    TickGenerationMode,
};

/// One simulation advance, handed to [`Simulation::tick`].
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// `true` for a step that applies a tick and advances the age; `false` for a local step
    /// interpolated between ticks (or a step of a local-only scene).
    pub advances_age: bool,
    /// Number of whole frames skipped in time-driven replay since the previous step.
    pub omitted_step_count: u32,
    /// The tick's events followed by pending local events.
    pub events: Option<Vec<Event>>,
}

/// What the simulation may do while it is being stepped.
///
/// Storage access, event raising and snapshots go through here, so the simulation never needs a
/// reference to the loop itself.
pub struct StepContext<'a> {
    controller: &'a mut TickController,
    events: &'a mut EventBuffer,
    time: f64,
}

impl StepContext<'_> {
    /// Current role.
    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.controller.execution_mode()
    }

    /// The permissions granted by the flow.
    #[must_use]
    pub fn permission(&self) -> FlowPermission {
        self.controller.permission()
    }

    /// Wall-clock time of the step in milliseconds.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// The age the loop consumes next.
    #[must_use]
    pub fn age(&self) -> Age {
        self.controller.current_age()
    }

    /// Starts loading storage values. The result arrives through
    /// [`Simulation::on_storage_loaded`].
    ///
    /// Pass the age of an earlier [`StorageLoaded`](crate::StorageLoaded) as `serialization`
    /// to re-read the same values from the tick log, e.g. after restoring a snapshot.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`] if a load is already outstanding in Active
    /// mode.
    pub fn storage_get(
        &mut self,
        keys: Vec<StorageKey>,
        serialization: Option<Age>,
    ) -> FlowResult<LoaderId> {
        self.controller.storage_get(keys, serialization)
    }

    /// Writes a storage value. Ignored in Passive mode.
    pub fn storage_put(&mut self, key: StorageKey, value: StorageValue, option: StoragePutOption) {
        self.controller.storage_put(key, value, option);
    }

    /// Configures the keys every future Join event resolves.
    pub fn request_values_for_join(&mut self, keys: Option<Vec<StorageKey>>) {
        self.controller.request_values_for_join(keys);
    }

    /// Raises an event as if it came from user input.
    pub fn raise_event(&mut self, event: Event) {
        self.events.on_event(event);
    }

    /// Generates one tick out of band carrying `events`. Ignored in Passive mode.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`] while a storage load is outstanding.
    pub fn raise_tick(&mut self, events: Vec<Event>) -> FlowResult<()> {
        if self.controller.execution_mode() != ExecutionMode::Active {
            trace!("ignoring raised tick in passive mode");
            return Ok(());
        }
        for event in events {
            self.events.add_event_direct(event);
        }
        self.controller.force_generate(self.events)
    }

    /// Publishes a snapshot as a start point at the current age. Ignored in Passive mode.
    pub fn save_snapshot(&mut self, snapshot: SnapshotData) {
        if self.controller.execution_mode() != ExecutionMode::Active {
            return;
        }
        let frame = self.controller.current_age();
        debug!(%frame, "publishing snapshot");
        self.controller.send(FlowRequest::PutStartPoint(StartPoint {
            frame,
            timestamp: self.time,
            data: StartPointData::Snapshot(snapshot),
        }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StartPointState {
    Idle,
    Awaiting(StartPointQuery),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Stepped,
    SceneChanged,
    Blocked,
}

struct LoopCore<S: Simulation> {
    simulation: S,
    controller: TickController,
    events: EventBuffer,
    config: LoopConfig,
    /// Nominal milliseconds per frame.
    frame_time: f64,
    /// Wall-clock position of the simulation in milliseconds.
    current_time: f64,
    target_time_func: Option<Box<dyn FnMut() -> f64>>,
    skipping: bool,
    waiting_next_tick: bool,
    waiting_elapsed: f64,
    start_point: StartPointState,
    last_requested_age: Option<Age>,
    last_requested_time: Option<f64>,
    /// A fetch at the end of the log came back empty.
    found_latest_tick: bool,
    /// Time jumped over in time-driven replay since the last step.
    omitted_time: f64,
    scene_mode: SceneMode,
    last_reached_target_time: Option<f64>,
    violation_observer: Option<Arc<dyn ViolationObserver>>,
    skip_changed: Signal<bool>,
    target_time_reached: Signal<f64>,
    error: Signal<FlowError>,
}

/// Drives a [`Simulation`] from a [`NonBlockingFlow`] at the pace of a [`Clock`].
///
/// Build one with [`GameLoopBuilder`](crate::GameLoopBuilder), then call
/// [`on_looper_call`](Self::on_looper_call) from a periodic callback source with the elapsed
/// milliseconds, and schedule the next call after the returned wait time.
pub struct GameLoop<S: Simulation, F: NonBlockingFlow> {
    clock: Clock,
    base_scale_factor: f64,
    flow: F,
    core: LoopCore<S>,
}

impl<S: Simulation, F: NonBlockingFlow> GameLoop<S, F> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        simulation: S,
        flow: F,
        clock_config: ClockConfig,
        buffer_config: TickBufferConfig,
        config: LoopConfig,
        permission: FlowPermission,
        execution_mode: ExecutionMode,
        violation_observer: Option<Arc<dyn ViolationObserver>>,
    ) -> FlowResult<Self> {
        let mut clock = Clock::new(clock_config);
        clock.change_scale_factor(clock_config.scale_factor * config.playback_rate);
        let frame_time = 1000.0 / clock.fps();
        let scene_mode = simulation.scene_mode();

        let mut game_loop = Self {
            clock,
            base_scale_factor: clock_config.scale_factor,
            flow,
            core: LoopCore {
                simulation,
                controller: TickController::new(buffer_config, permission),
                events: EventBuffer::new(permission),
                config,
                frame_time,
                current_time: 0.0,
                target_time_func: None,
                skipping: false,
                waiting_next_tick: false,
                waiting_elapsed: 0.0,
                start_point: StartPointState::Idle,
                last_requested_age: None,
                last_requested_time: None,
                found_latest_tick: false,
                omitted_time: 0.0,
                scene_mode,
                last_reached_target_time: None,
                violation_observer,
                skip_changed: Signal::new(),
                target_time_reached: Signal::new(),
                error: Signal::new(),
            },
        };
        game_loop.core.events.set_mode(event_buffer_mode(
            ExecutionMode::Passive,
            permission,
            config.default_event_priority,
        ));
        game_loop.set_execution_mode(execution_mode)?;
        Ok(game_loop)
    }

    /// Starts frame notifications and, in Active mode, tick generation.
    pub fn start(&mut self) {
        self.clock.start();
        self.core.controller.start_tick();
    }

    /// Stops frame notifications and tick generation. In-flight fetches still complete.
    pub fn stop(&mut self) {
        self.clock.stop();
        self.core.controller.stop_tick();
    }

    /// Whether the loop is started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.clock.is_running()
    }

    /// Processes one external callback with the elapsed milliseconds since the previous one.
    ///
    /// Returns the number of milliseconds to wait before the next call; a negative value asks
    /// for an immediate call.
    pub fn on_looper_call(&mut self, delta_time: f64) -> f64 {
        self.poll();
        let core = &mut self.core;
        let wait = self.clock.on_looper_call(delta_time, |args| core.on_frame(args));
        self.flush();
        wait
    }

    /// Applies exactly one tick in [`LoopMode::FrameByFrame`]. Returns whether a tick was
    /// applied.
    ///
    /// # Errors
    /// Returns [`FlowError::InvalidRequest`] in any other loop mode.
    pub fn advance_frame(&mut self) -> FlowResult<bool> {
        if self.core.config.loop_mode != LoopMode::FrameByFrame {
            return Err(FlowError::InvalidRequest {
                info: "advance_frame requires LoopMode::FrameByFrame".to_owned(),
            });
        }
        self.poll();
        self.core.events.process_events(false);
        let mut args = FrameArgs {
            delta_time: self.core.frame_time,
            interrupt: false,
        };
        let outcome = self.core.consume_and_step(&mut args);
        self.flush();
        Ok(outcome != StepOutcome::Blocked)
    }

    /// Restarts from `start_point`: restores the simulation and relocates the cursor, the
    /// wall-clock position and, in Active mode, the generator.
    ///
    /// # Errors
    /// Returns the simulation's restore error, or [`FlowError::NextAgeLocked`] in Active mode
    /// while a storage load is outstanding.
    pub fn reset(&mut self, start_point: StartPoint) -> FlowResult<()> {
        self.core.start_point = StartPointState::Idle;
        let result = self.core.jump_to(start_point);
        self.flush();
        result
    }

    /// Feeds an event from user input.
    pub fn on_event(&mut self, event: Event) {
        self.core.events.on_event(event);
    }

    /// Switches role.
    ///
    /// # Errors
    /// Returns [`FlowError::NotPermitted`] for Active without write permission.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) -> FlowResult<()> {
        let core = &mut self.core;
        core.controller.set_execution_mode(mode)?;
        core.events.set_mode(event_buffer_mode(
            mode,
            core.controller.permission(),
            core.config.default_event_priority,
        ));
        Ok(())
    }

    /// Current role.
    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.core.controller.execution_mode()
    }

    /// Changes the playback speed.
    ///
    /// # Errors
    /// Returns [`FlowError::InvalidConfig`] for a rate that is not a positive finite number.
    pub fn set_playback_rate(&mut self, rate: f64) -> FlowResult<()> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(FlowError::InvalidConfig {
                field: "playback_rate",
                reason: format!("{} is not a positive finite number", rate),
            });
        }
        self.core.config.playback_rate = rate;
        self.clock.change_scale_factor(self.base_scale_factor * rate);
        Ok(())
    }

    /// Changes what the loop catches up to.
    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        if self.core.config.loop_mode == mode {
            return;
        }
        debug!(?mode, "loop mode changed");
        self.core.config.loop_mode = mode;
        self.core.last_requested_age = None;
        self.core.last_requested_time = None;
        self.core.stop_skipping();
    }

    /// Sets the explicit target age for [`LoopMode::Replay`].
    pub fn set_target_age(&mut self, age: Option<Age>) {
        self.core.config.target_age = age;
    }

    /// Sets the function that yields the target time each frame in [`LoopMode::Replay`]. It
    /// takes precedence over the target age.
    pub fn set_target_time_func(&mut self, func: Option<Box<dyn FnMut() -> f64>>) {
        self.core.target_time_func = func;
        self.core.last_reached_target_time = None;
    }

    /// The current loop configuration.
    pub fn loop_config(&self) -> &LoopConfig {
        &self.core.config
    }

    /// Wall-clock position of the simulation in milliseconds.
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.core.current_time
    }

    /// The age the loop consumes next.
    #[must_use]
    pub fn current_age(&self) -> Age {
        self.core.controller.current_age()
    }

    /// Whether the loop is catching up.
    #[must_use]
    pub fn is_skipping(&self) -> bool {
        self.core.skipping
    }

    /// Whether the loop is blocked on the tick at the cursor.
    #[must_use]
    pub fn is_waiting_next_tick(&self) -> bool {
        self.core.waiting_next_tick
    }

    /// Whether a start point request is outstanding.
    #[must_use]
    pub fn is_awaiting_start_point(&self) -> bool {
        matches!(self.core.start_point, StartPointState::Awaiting(_))
    }

    /// Fired with `true` when the skip state is entered and `false` when it is left.
    pub fn skip_changed_mut(&mut self) -> &mut Signal<bool> {
        &mut self.core.skip_changed
    }

    /// Fired once per distinct target when time-driven replay reaches its target time.
    pub fn target_time_reached_mut(&mut self) -> &mut Signal<f64> {
        &mut self.core.target_time_reached
    }

    /// Fired for every asynchronous failure.
    pub fn error_mut(&mut self) -> &mut Signal<FlowError> {
        &mut self.core.error
    }

    /// Fired once per external callback after the frame notifications.
    pub fn raw_frame_mut(&mut self) -> &mut Signal<()> {
        self.clock.raw_frame_mut()
    }

    /// The simulation.
    pub fn simulation(&self) -> &S {
        &self.core.simulation
    }

    /// The simulation, mutably.
    pub fn simulation_mut(&mut self) -> &mut S {
        &mut self.core.simulation
    }

    /// The flow.
    pub fn flow(&self) -> &F {
        &self.flow
    }

    /// The flow, mutably.
    pub fn flow_mut(&mut self) -> &mut F {
        &mut self.flow
    }

    /// The clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The tick controller.
    pub fn controller(&self) -> &TickController {
        &self.core.controller
    }

    /// The event buffer, e.g. to register filters.
    pub fn event_buffer_mut(&mut self) -> &mut EventBuffer {
        &mut self.core.events
    }

    fn poll(&mut self) {
        for message in self.flow.receive_all() {
            self.core.handle_message(message);
        }
        self.core.controller.route();
        self.core.process_controller_events();
    }

    fn flush(&mut self) {
        self.core.controller.flush(&mut self.flow);
        for request in self.core.events.drain_requests() {
            self.flow.send(request);
        }
    }
}

impl<S: Simulation> LoopCore<S> {
    fn handle_message(&mut self, message: FlowMessage) {
        match message {
            FlowMessage::StartPoint { query, result } => self.on_start_point(query, result),
            other => self.controller.handle_message(other, &mut self.events),
        }
    }

    fn process_controller_events(&mut self) {
        let events: Vec<ControllerEvent> = self.controller.drain_events().collect();
        for event in events {
            match event {
                ControllerEvent::GotNextTick => {
                    if self.waiting_next_tick {
                        trace!("next tick arrived");
                        self.stop_waiting();
                    }
                },
                ControllerEvent::GotNoTick => {
                    if self.waiting_next_tick {
                        self.found_latest_tick = true;
                    }
                },
                ControllerEvent::Error(err) => self.report_error(err),
            }
        }
        self.deliver_storage();
    }

    fn deliver_storage(&mut self) {
        for loaded in self.controller.drain_storage_loaded() {
            self.simulation.on_storage_loaded(loaded);
        }
    }

    fn report_error(&mut self, err: FlowError) {
        let severity = if err.is_contract_violation() {
            ViolationSeverity::Error
        } else {
            ViolationSeverity::Warning
        };
        crate::report_violation_to!(
            self.violation_observer,
            severity,
            ViolationKind::GameLoop,
            "{}",
            err
        );
        self.error.fire(&err);
    }

    fn on_frame(&mut self, args: &mut FrameArgs) {
        let full_local = self.scene_mode.local == SceneLocalMode::FullLocal;
        self.events.process_events(full_local);
        if !full_local && self.scene_mode.tick_generation == TickGenerationMode::ByClock {
            self.controller.generate(&mut self.events);
        }
        self.controller.route();
        self.process_controller_events();

        if full_local {
            self.local_step(args);
            return;
        }
        match self.config.loop_mode {
            LoopMode::FrameByFrame => {},
            LoopMode::Replay if self.target_time_func.is_some() => self.on_frame_timed(args),
            LoopMode::Realtime | LoopMode::Replay => self.on_frame_normal(args),
        }
    }

    fn on_frame_normal(&mut self, args: &mut FrameArgs) {
        if self.waiting_next_tick && self.controller.has_next_tick() {
            self.stop_waiting();
        }
        if self.waiting_next_tick {
            self.watch_stalled_tick();
            self.interpolate_local_step(args);
            return;
        }

        let current = self.controller.current_age();
        let realtime = self.config.loop_mode == LoopMode::Realtime;
        // A relocated cursor counts everything before it as known.
        let target = if realtime {
            self.controller.known_latest_age().max(current - 1) + 1
        } else {
            match self.config.target_age {
                Some(age) => age,
                None => {
                    self.stop_skipping();
                    return;
                },
            }
        };
        let gap = target - current;

        if (gap > i64::from(self.config.jump_try_threshold) || (gap < 0 && !realtime))
            && self.start_point == StartPointState::Idle
            && self.last_requested_age != Some(target)
            && self.last_requested_age.is_none_or(|last| last < current)
        {
            self.last_requested_age = Some(target);
            self.request_start_point(StartPointQuery::Age(target));
        }

        if gap <= 0 {
            if gap == 0 || realtime {
                if current == 0 {
                    self.controller.request_ticks();
                }
                self.start_waiting();
            }
            self.stop_skipping();
            self.interpolate_local_step(args);
            return;
        }

        if !self.skipping
            && (gap > i64::from(self.config.skip_threshold) || current == 0)
            && self.controller.has_next_tick()
        {
            self.start_skipping();
        }

        let count = if !self.skipping && gap <= i64::from(self.config.delay_ignore_threshold) {
            1
        } else {
            gap.min(i64::from(self.config.skip_ticks_at_once))
        };
        for _ in 0..count {
            if self.consume_and_step(args) != StepOutcome::Stepped {
                break;
            }
        }
        if self.controller.current_age() >= target {
            self.stop_skipping();
        }
    }

    fn on_frame_timed(&mut self, args: &mut FrameArgs) {
        let Some(target_time_func) = self.target_time_func.as_mut() else {
            return;
        };
        let target_time = target_time_func() + self.config.target_time_offset;
        let frame_gap = (target_time - self.current_time) / self.frame_time;

        if (frame_gap > f64::from(self.config.jump_try_threshold) || frame_gap < 0.0)
            && self.start_point == StartPointState::Idle
            && self.last_requested_time != Some(target_time)
            && self
                .last_requested_time
                .is_none_or(|last| last < self.current_time)
        {
            self.last_requested_time = Some(target_time);
            self.request_start_point(StartPointQuery::Timestamp(target_time));
        }

        if frame_gap <= 0.0 {
            self.stop_skipping();
            self.interpolate_local_step(args);
            return;
        }

        let omit = self.config.omit_interpolated_tick_on_replay;
        if !self.skipping
            && (frame_gap > f64::from(self.config.skip_threshold)
                || (omit && self.found_latest_tick))
            && self.controller.has_next_tick()
        {
            self.start_skipping();
        }

        for _ in 0..self.config.skip_ticks_at_once {
            if !self.controller.has_next_tick() {
                if self.waiting_next_tick {
                    self.watch_stalled_tick();
                } else {
                    self.controller.request_ticks();
                    self.start_waiting();
                }
                if !(omit && self.skipping) {
                    self.interpolate_local_step(args);
                }
                if self.found_latest_tick && omit {
                    self.current_time = target_time;
                }
                break;
            }

            let next_frame_time = self.current_time + self.frame_time;
            let next_tick_time = self
                .controller
                .read_next_tick_time()
                .unwrap_or(next_frame_time);

            if next_tick_time > target_time {
                if next_frame_time <= target_time {
                    self.interpolate_local_step(args);
                    self.current_time = next_frame_time;
                } else {
                    self.stop_skipping();
                    if self.last_reached_target_time != Some(target_time) {
                        self.last_reached_target_time = Some(target_time);
                        debug!(target_time, "target time reached");
                        self.target_time_reached.fire(&target_time);
                    }
                }
                break;
            }

            if next_frame_time < next_tick_time {
                if omit && self.skipping {
                    self.omitted_time += next_tick_time - self.current_time;
                    self.current_time = next_tick_time;
                } else {
                    self.interpolate_local_step(args);
                    self.current_time = next_frame_time;
                    continue;
                }
            }

            if self.consume_and_step(args) != StepOutcome::Stepped {
                break;
            }
        }
    }

    fn consume_and_step(&mut self, args: &mut FrameArgs) -> StepOutcome {
        let tick_time = self.controller.read_next_tick_time();
        let Some(tick) = self.controller.consume() else {
            self.controller.request_ticks();
            self.start_waiting();
            return StepOutcome::Blocked;
        };
        let age = tick.age;
        self.current_time = tick_time.unwrap_or(self.current_time + self.frame_time);

        let mut events = tick.events.unwrap_or_default();
        if let Some(local) = self.events.read_local_events() {
            events.extend(local);
        }
        let previous_local = self.scene_mode.local;
        let scene_changed = self.step(true, events);

        if self.simulation.age() != age + 1 {
            crate::report_violation_to!(
                self.violation_observer,
                ViolationSeverity::Warning,
                ViolationKind::GameLoop,
                "simulation age {} after applying tick {}",
                self.simulation.age(),
                age
            );
        }
        if scene_changed {
            if self.scene_mode.local != previous_local {
                args.interrupt = true;
            }
            return StepOutcome::SceneChanged;
        }
        StepOutcome::Stepped
    }

    fn local_step(&mut self, args: &mut FrameArgs) {
        let events = self.events.read_local_events().unwrap_or_default();
        let previous_local = self.scene_mode.local;
        if self.step(false, events) && self.scene_mode.local != previous_local {
            args.interrupt = true;
        }
    }

    fn interpolate_local_step(&mut self, args: &mut FrameArgs) {
        if self.scene_mode.local == SceneLocalMode::InterpolateLocal {
            self.local_step(args);
        }
    }

    /// Runs one simulation step. Returns whether the scene changed.
    fn step(&mut self, advances_age: bool, events: Vec<Event>) -> bool {
        let omitted_step_count = (self.omitted_time / self.frame_time).floor() as u32;
        self.omitted_time = 0.0;
        let step = Step {
            advances_age,
            omitted_step_count,
            events: (!events.is_empty()).then_some(events),
        };

        let mut ctx = StepContext {
            controller: &mut self.controller,
            events: &mut self.events,
            time: self.current_time,
        };
        let scene_changed = self.simulation.tick(&mut ctx, step);

        self.controller.route();
        self.deliver_storage();
        if scene_changed {
            let scene_mode = self.simulation.scene_mode();
            if scene_mode != self.scene_mode {
                debug!(?scene_mode, "scene mode changed");
                self.scene_mode = scene_mode;
            }
        }
        scene_changed
    }

    fn start_skipping(&mut self) {
        self.skipping = true;
        self.events.start_skipping();
        debug!(age = %self.controller.current_age(), "skip started");
        self.skip_changed.fire(&true);
    }

    fn stop_skipping(&mut self) {
        if !self.skipping {
            return;
        }
        self.skipping = false;
        self.events.stop_skipping();
        debug!(age = %self.controller.current_age(), "skip stopped");
        self.skip_changed.fire(&false);
    }

    fn start_waiting(&mut self) {
        if !self.waiting_next_tick {
            self.waiting_next_tick = true;
            self.waiting_elapsed = 0.0;
        }
    }

    fn stop_waiting(&mut self) {
        self.waiting_next_tick = false;
        self.waiting_elapsed = 0.0;
        self.found_latest_tick = false;
    }

    fn watch_stalled_tick(&mut self) {
        self.waiting_elapsed += self.frame_time;
        if self.waiting_elapsed >= self.config.polling_interval.as_secs_f64() * 1000.0 {
            self.waiting_elapsed = 0.0;
            debug!(age = %self.controller.current_age(), "still waiting; polling for ticks");
            self.controller.request_ticks();
        }
    }

    fn request_start_point(&mut self, query: StartPointQuery) {
        debug!(?query, "requesting start point");
        self.start_point = StartPointState::Awaiting(query);
        self.controller.send(FlowRequest::GetStartPoint { query });
    }

    fn on_start_point(
        &mut self,
        query: StartPointQuery,
        result: Result<Option<StartPoint>, FlowError>,
    ) {
        if self.start_point != StartPointState::Awaiting(query) {
            trace!(?query, "ignoring unexpected start point response");
            return;
        }
        self.start_point = StartPointState::Idle;

        let start_point = match result {
            Ok(Some(start_point)) => start_point,
            Ok(None) => {
                debug!(?query, "no start point available");
                return;
            },
            Err(err) => {
                self.report_error(err);
                return;
            },
        };
        if !self.is_worth_jumping(query, &start_point) {
            debug!(frame = %start_point.frame, "discarding start point");
            return;
        }
        if let Err(err) = self.jump_to(start_point) {
            self.report_error(err);
        }
    }

    fn is_worth_jumping(&self, query: StartPointQuery, start_point: &StartPoint) -> bool {
        match query {
            StartPointQuery::Age(target) => {
                if target < start_point.frame {
                    return false;
                }
                let current = self.controller.current_age();
                !(current <= target
                    && start_point.frame < current + i64::from(self.config.jump_ignore_threshold))
            },
            StartPointQuery::Timestamp(target) => {
                if target < start_point.timestamp {
                    return false;
                }
                let ignore = f64::from(self.config.jump_ignore_threshold) * self.frame_time;
                !(self.current_time <= target && start_point.timestamp < self.current_time + ignore)
            },
        }
    }

    fn jump_to(&mut self, start_point: StartPoint) -> FlowResult<()> {
        let active = self.controller.execution_mode() == ExecutionMode::Active;
        if active && self.controller.generator().is_awaiting_storage() {
            return Err(FlowError::NextAgeLocked {
                requested: start_point.frame,
            });
        }
        self.stop_skipping();
        self.simulation.restore(&start_point)?;

        self.controller.set_current_age(start_point.frame);
        if active {
            self.controller.set_next_age(start_point.frame)?;
        }
        if start_point.is_root() {
            self.controller.set_time_origin(start_point.timestamp);
        }
        self.current_time = start_point.timestamp;
        self.stop_waiting();
        self.last_requested_age = None;
        self.last_requested_time = None;
        self.omitted_time = 0.0;
        self.controller.request_ticks();
        debug!(frame = %start_point.frame, "jumped to start point");
        Ok(())
    }
}

fn event_buffer_mode(
    mode: ExecutionMode,
    permission: FlowPermission,
    default_event_priority: u8,
) -> EventBufferMode {
    match mode {
        ExecutionMode::Active => EventBufferMode {
            is_local_receiver: true,
            is_receiver: true,
            is_sender: false,
            is_discarder: false,
            default_event_priority,
        },
        ExecutionMode::Passive => EventBufferMode {
            is_local_receiver: true,
            is_receiver: false,
            is_sender: permission.send_event,
            is_discarder: false,
            default_event_priority,
        },
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
    use crate::event::EventKind;
    use crate::tick::{Tick, TickList};
    use crate::StorageLoaded;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorder {
        age: i64,
        steps: Vec<Step>,
        restored: Vec<Age>,
        loaded: Vec<StorageLoaded>,
        scene: SceneMode,
        change_scene_at: Option<(i64, SceneMode)>,
    }

    impl Simulation for Recorder {
        fn tick(&mut self, _ctx: &mut StepContext<'_>, step: Step) -> bool {
            let advances = step.advances_age;
            self.steps.push(step);
            if !advances {
                return false;
            }
            self.age += 1;
            match self.change_scene_at {
                Some((age, scene)) if age == self.age => {
                    self.scene = scene;
                    true
                },
                _ => false,
            }
        }

        fn restore(&mut self, start_point: &StartPoint) -> FlowResult<()> {
            self.age = start_point.frame.as_i64();
            self.restored.push(start_point.frame);
            Ok(())
        }

        fn scene_mode(&self) -> SceneMode {
            self.scene
        }

        fn age(&self) -> Age {
            Age::new(self.age)
        }

        fn fps(&self) -> f64 {
            50.0
        }

        fn on_storage_loaded(&mut self, loaded: StorageLoaded) {
            self.loaded.push(loaded);
        }
    }

    #[derive(Default)]
    struct Queue {
        inbox: Vec<FlowMessage>,
        sent: Vec<FlowRequest>,
    }

    impl NonBlockingFlow for Queue {
        fn send(&mut self, request: FlowRequest) {
            self.sent.push(request);
        }

        fn receive_all(&mut self) -> Vec<FlowMessage> {
            std::mem::take(&mut self.inbox)
        }
    }

    fn game_loop(mode: ExecutionMode, config: LoopConfig) -> GameLoop<Recorder, Queue> {
        let permission = match mode {
            ExecutionMode::Active => FlowPermission::active(),
            ExecutionMode::Passive => FlowPermission::passive(),
        };
        let mut game_loop = GameLoop::new(
            Recorder::default(),
            Queue::default(),
            ClockConfig::default().with_fps(50.0),
            TickBufferConfig::default(),
            config,
            permission,
            mode,
            None,
        )
        .unwrap();
        game_loop.start();
        game_loop
    }

    fn tick_list(start: i64, end: i64) -> FlowMessage {
        FlowMessage::TickList {
            begin: Age::new(start),
            end: Age::new(end),
            result: Ok(Some(TickList::new(Age::new(start), Age::new(end), vec![]))),
        }
    }

    fn fetches(game_loop: &mut GameLoop<Recorder, Queue>) -> usize {
        game_loop
            .flow_mut()
            .sent
            .drain(..)
            .filter(|request| matches!(request, FlowRequest::FetchTicks { .. }))
            .count()
    }

    #[test]
    fn passive_loop_applies_ticks_one_per_frame_when_close() {
        let mut game_loop = game_loop(ExecutionMode::Passive, LoopConfig::default());
        game_loop.flow_mut().inbox.push(tick_list(0, 3));
        // First frame at age 0 catches up at once.
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 3);
        assert!(game_loop.simulation().steps.iter().all(|step| step.advances_age));

        // Caught up: the loop waits for the next tick.
        game_loop.on_looper_call(20.0);
        assert!(game_loop.is_waiting_next_tick());
        assert!(!game_loop.is_skipping());

        game_loop.flow_mut().inbox.push(FlowMessage::Tick(Tick::new(Age::new(3))));
        game_loop.flow_mut().inbox.push(FlowMessage::Tick(Tick::new(Age::new(4))));
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 4);
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 5);
    }

    #[test]
    fn active_loop_generates_and_applies_events() {
        let mut game_loop = game_loop(ExecutionMode::Active, LoopConfig::default());
        game_loop.on_event(Event::new(EventKind::Message { data: vec![1] }));
        game_loop.on_looper_call(20.0);

        assert_eq!(game_loop.simulation().age, 1);
        let events = game_loop.simulation().steps[0].events.clone().unwrap();
        assert_eq!(events.len(), 1);
        assert!(game_loop.flow().sent.iter().any(|request| {
            matches!(request, FlowRequest::PushTick(tick) if tick.age == Age::new(0))
        }));
    }

    #[test]
    fn waiting_loop_polls_once_per_interval() {
        let config = LoopConfig {
            polling_interval: web_time::Duration::from_millis(100),
            ..LoopConfig::default()
        };
        let mut game_loop = game_loop(ExecutionMode::Passive, config);
        game_loop.on_looper_call(20.0);
        assert!(game_loop.is_waiting_next_tick());
        assert_eq!(fetches(&mut game_loop), 1);

        for _ in 0..4 {
            game_loop.on_looper_call(20.0);
        }
        assert_eq!(fetches(&mut game_loop), 0);
        game_loop.on_looper_call(20.0);
        assert_eq!(fetches(&mut game_loop), 1);

        game_loop.flow_mut().inbox.push(tick_list(0, 1));
        game_loop.on_looper_call(20.0);
        assert!(!game_loop.is_waiting_next_tick());
        assert_eq!(game_loop.simulation().age, 1);
    }

    #[test]
    fn skip_state_is_reported() {
        let mut game_loop = game_loop(ExecutionMode::Passive, LoopConfig::default());
        let changes = Rc::new(Cell::new(0));
        let counter = changes.clone();
        game_loop
            .skip_changed_mut()
            .subscribe(move |_| counter.set(counter.get() + 1));

        game_loop.flow_mut().inbox.push(tick_list(0, 250));
        game_loop.on_looper_call(20.0);
        assert!(game_loop.is_skipping());
        assert_eq!(game_loop.simulation().age, 100);
        game_loop.on_looper_call(20.0);
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 250);
        game_loop.on_looper_call(20.0);
        assert!(!game_loop.is_skipping());
        assert_eq!(changes.get(), 2);
    }

    #[test]
    fn scene_change_abandons_the_frame_budget() {
        let mut game_loop = game_loop(ExecutionMode::Passive, LoopConfig::default());
        game_loop.simulation_mut().change_scene_at = Some((
            2,
            SceneMode::new(SceneLocalMode::FullLocal, TickGenerationMode::ByClock),
        ));
        game_loop.flow_mut().inbox.push(tick_list(0, 50));
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 2);

        // The full-local scene now only steps locally.
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 2);
        assert!(!game_loop.simulation().steps.last().unwrap().advances_age);
    }

    #[test]
    fn frame_by_frame_only_advances_on_request() {
        let config = LoopConfig {
            loop_mode: LoopMode::FrameByFrame,
            ..LoopConfig::default()
        };
        let mut game_loop = game_loop(ExecutionMode::Passive, config);
        game_loop.flow_mut().inbox.push(tick_list(0, 5));
        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 0);
        assert!(game_loop.advance_frame().unwrap());
        assert_eq!(game_loop.simulation().age, 1);

        game_loop.set_loop_mode(LoopMode::Realtime);
        assert!(game_loop.advance_frame().is_err());
    }

    #[test]
    fn reset_relocates_cursor_and_time() {
        let mut game_loop = game_loop(ExecutionMode::Active, LoopConfig::default());
        let start_point = StartPoint {
            frame: Age::new(40),
            timestamp: 5_000.0,
            data: StartPointData::Snapshot(SnapshotData {
                random_generator: vec![],
                next_entity_id: 1,
                snapshot: vec![],
            }),
        };
        game_loop.reset(start_point).unwrap();
        assert_eq!(game_loop.current_age(), Age::new(40));
        assert_eq!(game_loop.current_time(), 5_000.0);
        assert_eq!(game_loop.controller().generator().next_age(), Age::new(40));

        game_loop.on_looper_call(20.0);
        assert_eq!(game_loop.simulation().age, 41);
    }

    #[test]
    fn playback_rate_must_be_positive() {
        let mut game_loop = game_loop(ExecutionMode::Passive, LoopConfig::default());
        assert!(game_loop.set_playback_rate(0.0).is_err());
        assert!(game_loop.set_playback_rate(f64::NAN).is_err());
        game_loop.set_playback_rate(2.0).unwrap();
        assert_eq!(game_loop.clock().wait_time(), 10.0);
    }

    #[test]
    fn passive_without_write_permission_cannot_go_active() {
        let mut game_loop = game_loop(ExecutionMode::Passive, LoopConfig::default());
        assert!(matches!(
            game_loop.set_execution_mode(ExecutionMode::Active),
            Err(FlowError::NotPermitted { .. })
        ));
    }
}
