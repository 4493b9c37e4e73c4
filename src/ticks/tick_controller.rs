//! Composition of tick production, the tick log and storage access.
//!
//! The [`TickController`] presents the same consumption interface in both roles: in
//! [`ExecutionMode::Active`] every generated tick is pushed to the remote channel and into the
//! controller's own [`TickBuffer`]; in [`ExecutionMode::Passive`] the buffer is filled from the
//! remote channel only.

use std::collections::VecDeque;

use crate::config::TickBufferConfig;
use crate::error::{FlowError, FlowResult};
use crate::event_buffer::EventBuffer;
use crate::flow::messages::{FlowMessage, FlowPermission, FlowRequest, StorageTicket};
use crate::storage::{LoaderId, StorageKey, StorageLoaded, StoragePutOption, StorageValue};
use crate::tick::Tick;
use crate::ticks::storage_resolver::StorageResolver;
use crate::ticks::tick_buffer::{TickBuffer, TickBufferEvent};
use crate::ticks::tick_generator::{GeneratorEvent, TickGenerator};
use crate::{Age, ExecutionMode, NonBlockingFlow};

/// Notifications the [`GameLoop`](crate::GameLoop) reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// The tick at the cursor became available.
    GotNextTick,
    /// A tick fetch returned nothing.
    GotNoTick,
    /// A remote operation failed.
    Error(FlowError),
}

/// Owns the generator, the tick log and the storage resolver.
#[derive(Debug)]
pub struct TickController {
    generator: TickGenerator,
    buffer: TickBuffer,
    storage: StorageResolver,
    permission: FlowPermission,
    execution_mode: ExecutionMode,
    generating: bool,
    outbox: VecDeque<FlowRequest>,
    events: VecDeque<ControllerEvent>,
}

impl TickController {
    /// Creates a controller in [`ExecutionMode::Passive`] with generation stopped.
    #[must_use]
    pub fn new(config: TickBufferConfig, permission: FlowPermission) -> Self {
        Self {
            generator: TickGenerator::new(),
            buffer: TickBuffer::new(config, ExecutionMode::Passive),
            storage: StorageResolver::new(ExecutionMode::Passive),
            permission,
            execution_mode: ExecutionMode::Passive,
            generating: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Current role.
    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    /// The permissions granted by the flow.
    #[must_use]
    pub fn permission(&self) -> FlowPermission {
        self.permission
    }

    /// Switches role on the generator, the tick log and the storage resolver together.
    ///
    /// Switching to Active positions the generator at the log's cursor.
    ///
    /// # Errors
    /// Returns [`FlowError::NotPermitted`] for Active without write permission, and
    /// [`FlowError::NextAgeLocked`] if the generator awaits storage.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) -> FlowResult<()> {
        if mode == self.execution_mode {
            return Ok(());
        }
        if mode == ExecutionMode::Active {
            if !self.permission.write_tick {
                return Err(FlowError::NotPermitted {
                    operation: "switch to active execution mode",
                });
            }
            self.generator.set_next_age(self.buffer.current_age())?;
        }
        self.buffer.set_execution_mode(mode);
        self.storage.set_execution_mode(mode);
        self.execution_mode = mode;
        self.update_generation();
        tracing::debug!(?mode, "execution mode switched");
        Ok(())
    }

    /// Enables clock-driven generation (effective in Active mode only).
    pub fn start_tick(&mut self) {
        self.generating = true;
        self.update_generation();
    }

    /// Disables clock-driven generation.
    pub fn stop_tick(&mut self) {
        self.generating = false;
        self.update_generation();
    }

    /// Whether clock-driven generation is currently in effect.
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.generator.is_enabled()
    }

    /// Generates the tick for this frame, if generation is in effect.
    pub fn generate(&mut self, events: &mut EventBuffer) {
        if let Some(tick) = self.generator.next(events) {
            self.push_generated(tick);
        }
    }

    /// Generates one tick even while generation is stopped.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`] while the generator awaits storage.
    pub fn force_generate(&mut self, events: &mut EventBuffer) -> FlowResult<()> {
        let tick = self.generator.force_next(events)?;
        self.push_generated(tick);
        Ok(())
    }

    /// Applies one message from the remote channel.
    ///
    /// Start point responses are not handled here.
    pub fn handle_message(&mut self, message: FlowMessage, events: &mut EventBuffer) {
        match message {
            FlowMessage::Tick(tick) => self.buffer.add_tick(tick),
            FlowMessage::Event(event) => events.on_remote_event(event),
            FlowMessage::TickList { begin, end, result } => {
                self.buffer.on_tick_list(begin, end, result);
            },
            FlowMessage::Storage {
                ticket: StorageTicket::TickGeneration { age },
                result,
            } => {
                if let Some(tick) = self.generator.on_storage(age, result, events) {
                    self.push_generated(tick);
                }
            },
            FlowMessage::Storage {
                ticket: StorageTicket::Join { sequence },
                result,
            } => {
                self.generator
                    .join_resolver_mut()
                    .on_storage(sequence, result);
            },
            FlowMessage::StartPoint { query, .. } => {
                tracing::trace!(?query, "start point response not handled by the controller");
            },
        }
        self.route();
    }

    /// Moves component notifications to where they belong.
    pub fn route(&mut self) {
        for event in self.generator.drain_events() {
            match event {
                GeneratorEvent::GotStorage { age, storage } => {
                    self.storage.on_generator_storage(age, storage);
                },
                GeneratorEvent::Error(err) => self.events.push_back(ControllerEvent::Error(err)),
            }
        }
        for err in self.generator.join_resolver_mut().drain_errors() {
            self.events.push_back(ControllerEvent::Error(err));
        }
        for event in self.buffer.drain_events() {
            match event {
                TickBufferEvent::GotNextTick => {
                    self.events.push_back(ControllerEvent::GotNextTick);
                },
                TickBufferEvent::GotNoTick => self.events.push_back(ControllerEvent::GotNoTick),
                TickBufferEvent::GotStorage { age, storage } => {
                    self.storage.on_buffer_storage(age, storage);
                },
                TickBufferEvent::FetchFailed(err) => {
                    self.events.push_back(ControllerEvent::Error(err));
                },
            }
        }
    }

    /// Drains notifications for the loop.
    pub fn drain_events(&mut self) -> std::collections::vec_deque::Drain<'_, ControllerEvent> {
        self.events.drain(..)
    }

    /// Drains completed storage loads.
    pub fn drain_storage_loaded(
        &mut self,
    ) -> std::collections::vec_deque::Drain<'_, StorageLoaded> {
        self.storage.drain_completions()
    }

    /// Queues a request for the remote channel.
    pub fn send(&mut self, request: FlowRequest) {
        self.outbox.push_back(request);
    }

    /// Sends every queued request of every component through `flow`.
    pub fn flush(&mut self, flow: &mut impl NonBlockingFlow) {
        for request in self.outbox.drain(..) {
            flow.send(request);
        }
        for request in self.generator.drain_requests() {
            flow.send(request);
        }
        for request in self.buffer.drain_requests() {
            flow.send(request);
        }
        for request in self.storage.drain_requests() {
            flow.send(request);
        }
    }

    /// The age the next [`consume`](Self::consume) returns.
    #[must_use]
    pub fn current_age(&self) -> Age {
        self.buffer.current_age()
    }

    /// Highest age ever observed.
    #[must_use]
    pub fn known_latest_age(&self) -> Age {
        self.buffer.known_latest_age()
    }

    /// Whether the tick at the cursor is available.
    #[must_use]
    pub fn has_next_tick(&self) -> bool {
        self.buffer.has_next_tick()
    }

    /// Consumes the tick at the cursor.
    pub fn consume(&mut self) -> Option<Tick> {
        let tick = self.buffer.consume();
        self.storage.set_cursor(self.buffer.current_age());
        tick
    }

    /// Relocates the cursor, dropping older data.
    pub fn set_current_age(&mut self, age: Age) {
        self.buffer.set_current_age(age);
        self.storage.set_cursor(age);
    }

    /// Sets the age of the next generated tick.
    ///
    /// # Errors
    /// Returns [`FlowError::NextAgeLocked`] while the generator awaits storage.
    pub fn set_next_age(&mut self, age: Age) -> FlowResult<()> {
        self.generator.set_next_age(age)
    }

    /// Requests a batch of ticks starting at the cursor (Passive only).
    pub fn request_ticks(&mut self) {
        self.buffer.request_next_ticks();
    }

    /// Timestamp of the tick at the cursor, if it carries one.
    pub fn read_next_tick_time(&mut self) -> Option<f64> {
        self.buffer.read_next_tick_time()
    }

    /// Sets the absolute base for relative tick timestamps.
    pub fn set_time_origin(&mut self, origin: f64) {
        self.buffer.set_time_origin(origin);
    }

    /// Starts a storage load.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`] in Active mode while a load is outstanding.
    pub fn storage_get(
        &mut self,
        keys: Vec<StorageKey>,
        serialization: Option<Age>,
    ) -> FlowResult<LoaderId> {
        self.storage
            .get(keys, serialization, &mut self.generator, &mut self.buffer)
    }

    /// Writes a storage value (Active only).
    pub fn storage_put(&mut self, key: StorageKey, value: StorageValue, option: StoragePutOption) {
        self.storage.put(key, value, option);
    }

    /// Configures the keys every future Join resolves.
    pub fn request_values_for_join(&mut self, keys: Option<Vec<StorageKey>>) {
        self.generator.join_resolver_mut().request_values_for_join(keys);
    }

    /// The tick log.
    #[must_use]
    pub fn buffer(&self) -> &TickBuffer {
        &self.buffer
    }

    /// The generator.
    #[must_use]
    pub fn generator(&self) -> &TickGenerator {
        &self.generator
    }

    fn push_generated(&mut self, tick: Tick) {
        tracing::trace!(age = %tick.age, "generated tick");
        self.outbox.push_back(FlowRequest::PushTick(tick.clone()));
        self.buffer.add_tick(tick);
    }

    fn update_generation(&mut self) {
        if self.generating && self.execution_mode == ExecutionMode::Active {
            self.generator.start();
        } else {
            self.generator.stop();
        }
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
    use crate::event::{Event, EventKind};
    use crate::event_buffer::EventBufferMode;
    use crate::storage::{StorageEntry, StorageRegion};
    use crate::tick::TickList;

    #[derive(Default)]
    struct Sink {
        sent: Vec<FlowRequest>,
    }

    impl NonBlockingFlow for Sink {
        fn send(&mut self, request: FlowRequest) {
            self.sent.push(request);
        }

        fn receive_all(&mut self) -> Vec<FlowMessage> {
            Vec::new()
        }
    }

    fn receiver() -> EventBuffer {
        let mut buffer = EventBuffer::new(FlowPermission::active());
        buffer.set_mode(EventBufferMode {
            is_receiver: true,
            ..EventBufferMode::default()
        });
        buffer
    }

    fn active() -> TickController {
        let mut controller =
            TickController::new(TickBufferConfig::default(), FlowPermission::active());
        controller.set_execution_mode(ExecutionMode::Active).unwrap();
        controller.start_tick();
        controller
    }

    #[test]
    fn active_without_write_permission_is_rejected() {
        let mut controller =
            TickController::new(TickBufferConfig::default(), FlowPermission::passive());
        assert_eq!(
            controller.set_execution_mode(ExecutionMode::Active),
            Err(FlowError::NotPermitted {
                operation: "switch to active execution mode"
            })
        );
        assert_eq!(controller.execution_mode(), ExecutionMode::Passive);
    }

    #[test]
    fn generated_ticks_are_pushed_and_consumable() {
        let mut controller = active();
        let mut events = receiver();
        events.on_event(Event::new(EventKind::Message { data: vec![7] }));
        events.process_events(false);

        controller.generate(&mut events);
        controller.route();
        assert_eq!(
            controller.drain_events().collect::<Vec<_>>(),
            vec![ControllerEvent::GotNextTick]
        );
        let mut sink = Sink::default();
        controller.flush(&mut sink);
        assert!(matches!(
            &sink.sent[..],
            [FlowRequest::PushTick(tick)] if tick.age == Age::new(0)
        ));

        let tick = controller.consume().unwrap();
        assert_eq!(tick.events.unwrap().len(), 1);
        assert_eq!(controller.current_age(), Age::new(1));
    }

    #[test]
    fn generation_only_runs_in_active_mode() {
        let mut controller =
            TickController::new(TickBufferConfig::default(), FlowPermission::active());
        let mut events = receiver();
        controller.start_tick();
        controller.generate(&mut events);
        assert!(!controller.has_next_tick());

        controller.set_execution_mode(ExecutionMode::Active).unwrap();
        assert!(controller.is_generating());
        controller.stop_tick();
        controller.generate(&mut events);
        assert!(!controller.has_next_tick());
        controller.force_generate(&mut events).unwrap();
        assert!(controller.has_next_tick());
    }

    #[test]
    fn passive_messages_fill_the_log() {
        let mut controller =
            TickController::new(TickBufferConfig::default(), FlowPermission::passive());
        let mut events = receiver();
        controller.handle_message(
            FlowMessage::TickList {
                begin: Age::new(0),
                end: Age::new(3),
                result: Ok(Some(TickList::new(Age::new(0), Age::new(3), vec![]))),
            },
            &mut events,
        );
        controller.handle_message(FlowMessage::Tick(Tick::new(Age::new(3))), &mut events);
        assert_eq!(controller.known_latest_age(), Age::new(3));
        assert_eq!(
            controller.drain_events().collect::<Vec<_>>(),
            vec![ControllerEvent::GotNextTick]
        );

        controller.handle_message(
            FlowMessage::Event(Event::new(EventKind::Message { data: vec![] })),
            &mut events,
        );
        events.process_events(false);
        assert!(events.read_events().is_some());
    }

    #[test]
    fn generator_storage_reaches_the_loader() {
        let mut controller = active();
        let mut events = receiver();
        let key = StorageKey::new(StorageRegion::Values, "v");
        let loader = controller.storage_get(vec![key.clone()], None).unwrap();

        let mut sink = Sink::default();
        controller.flush(&mut sink);
        assert!(matches!(
            &sink.sent[..],
            [FlowRequest::GetStorage { ticket: StorageTicket::TickGeneration { .. }, .. }]
        ));

        let entry = StorageEntry {
            key,
            values: vec![StorageValue::Text("x".into())],
        };
        controller.handle_message(
            FlowMessage::Storage {
                ticket: StorageTicket::TickGeneration { age: Age::new(0) },
                result: Ok(vec![entry.clone()]),
            },
            &mut events,
        );
        let loaded: Vec<_> = controller.drain_storage_loaded().collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].loader, loader);
        assert_eq!(controller.consume().unwrap().storage, Some(vec![entry]));
    }

    #[test]
    fn fetch_errors_surface_as_events() {
        let mut controller =
            TickController::new(TickBufferConfig::default(), FlowPermission::passive());
        let mut events = receiver();
        controller.handle_message(
            FlowMessage::TickList {
                begin: Age::new(0),
                end: Age::new(600),
                result: Err(FlowError::FetchFailed {
                    resource: "ticks",
                    context: "closed".into(),
                }),
            },
            &mut events,
        );
        assert!(matches!(
            controller.drain_events().next(),
            Some(ControllerEvent::Error(FlowError::FetchFailed { .. }))
        ));
    }
}
