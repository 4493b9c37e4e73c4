//! Authoritative tick production for [`ExecutionMode::Active`](crate::ExecutionMode::Active).

use std::collections::VecDeque;

use crate::error::{FlowError, FlowResult};
use crate::event_buffer::EventBuffer;
use crate::flow::messages::{FlowRequest, StorageTicket};
use crate::storage::{StorageEntry, StorageKey};
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::tick::Tick;
use crate::ticks::join_resolver::JoinResolver;
use crate::Age;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeneratorState {
    Idle,
    AwaitingStorage { age: Age },
}

/// Notifications produced by the [`TickGenerator`].
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorEvent {
    /// Storage values requested with [`TickGenerator::request_storage_tick`] arrived and are
    /// embedded in the tick at `age`.
    GotStorage {
        /// The age the values are bound to.
        age: Age,
        /// The values.
        storage: Vec<StorageEntry>,
    },
    /// The storage request failed. Generation resumes without the values.
    Error(FlowError),
}

/// Produces one tick per call from the buffered events.
///
/// At most one storage request is outstanding at a time; while it is, generation is suspended
/// and the next age is locked, because the values are bound to the age at request time.
#[derive(Debug)]
pub struct TickGenerator {
    next_age: Age,
    enabled: bool,
    state: GeneratorState,
    join_resolver: JoinResolver,
    storage_for_next: Option<Vec<StorageEntry>>,
    outbox: VecDeque<FlowRequest>,
    event_queue: VecDeque<GeneratorEvent>,
}

impl Default for TickGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TickGenerator {
    /// Creates a stopped generator whose first tick is age 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_age: Age::new(0),
            enabled: false,
            state: GeneratorState::Idle,
            join_resolver: JoinResolver::new(),
            storage_for_next: None,
            outbox: VecDeque::new(),
            event_queue: VecDeque::new(),
        }
    }

    /// The age of the next generated tick.
    #[must_use]
    pub fn next_age(&self) -> Age {
        self.next_age
    }

    /// Whether clock-driven generation is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a storage request is outstanding.
    #[must_use]
    pub fn is_awaiting_storage(&self) -> bool {
        matches!(self.state, GeneratorState::AwaitingStorage { .. })
    }

    /// Enables clock-driven generation.
    pub fn start(&mut self) {
        self.enabled = true;
    }

    /// Disables clock-driven generation. [`force_next`](Self::force_next) still works.
    pub fn stop(&mut self) {
        self.enabled = false;
    }

    /// The resolver join and leave events pass through.
    pub fn join_resolver_mut(&mut self) -> &mut JoinResolver {
        &mut self.join_resolver
    }

    /// Generates one tick if enabled and no storage request is outstanding.
    pub fn next(&mut self, events: &mut EventBuffer) -> Option<Tick> {
        if !self.enabled || self.is_awaiting_storage() {
            return None;
        }
        Some(self.generate(events))
    }

    /// Generates one tick even while disabled.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`] while a storage request is outstanding.
    pub fn force_next(&mut self, events: &mut EventBuffer) -> FlowResult<Tick> {
        if let GeneratorState::AwaitingStorage { age } = self.state {
            crate::report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Storage,
                "forced tick generation while storage for age {} is outstanding",
                age
            );
            return Err(FlowError::StorageRequestPending);
        }
        Ok(self.generate(events))
    }

    /// Requests storage values to be embedded in the next generated tick, and suspends generation
    /// until they arrive. Returns the age they will be bound to.
    ///
    /// # Errors
    /// Returns [`FlowError::StorageRequestPending`] if a request is already outstanding.
    pub fn request_storage_tick(&mut self, keys: Vec<StorageKey>) -> FlowResult<Age> {
        if let GeneratorState::AwaitingStorage { age } = self.state {
            crate::report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Storage,
                "second storage request while age {} is outstanding",
                age
            );
            return Err(FlowError::StorageRequestPending);
        }
        let age = self.next_age;
        self.state = GeneratorState::AwaitingStorage { age };
        self.outbox.push_back(FlowRequest::GetStorage {
            ticket: StorageTicket::TickGeneration { age },
            keys,
        });
        tracing::debug!(%age, "awaiting storage for tick generation");
        Ok(age)
    }

    /// Completes the outstanding storage request for `age`.
    ///
    /// Responses for any other age are ignored. On success the storage tick is generated
    /// immediately and returned.
    pub fn on_storage(
        &mut self,
        age: Age,
        result: Result<Vec<StorageEntry>, FlowError>,
        events: &mut EventBuffer,
    ) -> Option<Tick> {
        match self.state {
            GeneratorState::AwaitingStorage { age: expected } if expected == age => {},
            _ => {
                tracing::trace!(%age, "ignoring irrelevant storage response");
                return None;
            },
        }
        self.state = GeneratorState::Idle;
        match result {
            Ok(storage) => {
                self.event_queue.push_back(GeneratorEvent::GotStorage {
                    age,
                    storage: storage.clone(),
                });
                self.storage_for_next = Some(storage);
                Some(self.generate(events))
            },
            Err(err) => {
                crate::report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::Storage,
                    "storage fetch for age {} failed: {}",
                    age,
                    err
                );
                self.event_queue.push_back(GeneratorEvent::Error(err));
                None
            },
        }
    }

    /// Sets the age of the next generated tick.
    ///
    /// # Errors
    /// Returns [`FlowError::NextAgeLocked`] while a storage request is outstanding.
    pub fn set_next_age(&mut self, age: Age) -> FlowResult<()> {
        if self.is_awaiting_storage() {
            crate::report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Storage,
                "next age change to {} while a storage request is outstanding",
                age
            );
            return Err(FlowError::NextAgeLocked { requested: age });
        }
        self.next_age = age;
        Ok(())
    }

    /// Drains notifications.
    pub fn drain_events(&mut self) -> std::collections::vec_deque::Drain<'_, GeneratorEvent> {
        self.event_queue.drain(..)
    }

    /// Drains requests for the remote channel, including the join resolver's.
    pub fn drain_requests(&mut self) -> Vec<FlowRequest> {
        let mut requests: Vec<FlowRequest> = self.join_resolver.drain_requests().collect();
        requests.extend(self.outbox.drain(..));
        requests
    }

    fn generate(&mut self, events: &mut EventBuffer) -> Tick {
        if let Some(join_leaves) = events.read_join_leaves() {
            for event in join_leaves {
                self.join_resolver.request(event);
            }
        }
        let mut payload = events.read_events().unwrap_or_default();
        if let Some(resolved) = self.join_resolver.read_resolved() {
            payload.extend(resolved);
        }

        let mut tick = Tick::new(self.next_age).with_events(payload);
        if let Some(storage) = self.storage_for_next.take() {
            tick = tick.with_storage(storage);
        }
        self.next_age += 1;
        tick
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
    use crate::flow::messages::FlowPermission;
    use crate::storage::{StorageRegion, StorageValue};
    use crate::PlayerId;

    fn receiver() -> EventBuffer {
        let mut buffer = EventBuffer::new(FlowPermission::active());
        buffer.set_mode(EventBufferMode {
            is_receiver: true,
            ..EventBufferMode::default()
        });
        buffer
    }

    fn key() -> StorageKey {
        StorageKey::new(StorageRegion::Scores, "best")
    }

    fn entry() -> StorageEntry {
        StorageEntry {
            key: key(),
            values: vec![StorageValue::Number(10.0)],
        }
    }

    fn message(tag: u8) -> Event {
        Event::new(EventKind::Message { data: vec![tag] })
    }

    #[test]
    fn disabled_generator_produces_nothing() {
        let mut generator = TickGenerator::new();
        let mut events = receiver();
        assert!(generator.next(&mut events).is_none());
        generator.start();
        assert_eq!(generator.next(&mut events), Some(Tick::new(Age::new(0))));
        assert_eq!(generator.next_age(), Age::new(1));
    }

    #[test]
    fn tick_carries_events_then_resolved_joins() {
        let mut generator = TickGenerator::new();
        generator.start();
        let mut events = receiver();
        events.on_event(Event::join(PlayerId::from("p"), None));
        events.on_event(message(1));
        events.process_events(false);

        let tick = generator.next(&mut events).unwrap();
        let payload = tick.events.unwrap();
        assert_eq!(payload.len(), 2);
        assert_eq!(payload[0], message(1));
        assert!(payload[1].is_join_or_leave());
    }

    #[test]
    fn storage_request_suspends_and_resumes_generation() {
        let mut generator = TickGenerator::new();
        generator.start();
        let mut events = receiver();
        generator.next(&mut events);

        let age = generator.request_storage_tick(vec![key()]).unwrap();
        assert_eq!(age, Age::new(1));
        assert_eq!(
            generator.drain_requests(),
            vec![FlowRequest::GetStorage {
                ticket: StorageTicket::TickGeneration { age },
                keys: vec![key()]
            }]
        );
        assert!(generator.next(&mut events).is_none());
        assert_eq!(
            generator.force_next(&mut events),
            Err(FlowError::StorageRequestPending)
        );
        assert_eq!(
            generator.request_storage_tick(vec![key()]),
            Err(FlowError::StorageRequestPending)
        );
        assert_eq!(
            generator.set_next_age(Age::new(9)),
            Err(FlowError::NextAgeLocked {
                requested: Age::new(9)
            })
        );

        let tick = generator
            .on_storage(age, Ok(vec![entry()]), &mut events)
            .unwrap();
        assert_eq!(tick.age, age);
        assert_eq!(tick.storage, Some(vec![entry()]));
        assert_eq!(
            generator.drain_events().collect::<Vec<_>>(),
            vec![GeneratorEvent::GotStorage {
                age,
                storage: vec![entry()]
            }]
        );
        assert_eq!(generator.next(&mut events).unwrap().storage, None);
    }

    #[test]
    fn irrelevant_storage_response_is_ignored() {
        let mut generator = TickGenerator::new();
        let mut events = receiver();
        assert!(generator
            .on_storage(Age::new(0), Ok(vec![entry()]), &mut events)
            .is_none());
        generator.request_storage_tick(vec![key()]).unwrap();
        assert!(generator
            .on_storage(Age::new(5), Ok(vec![entry()]), &mut events)
            .is_none());
        assert!(generator.is_awaiting_storage());
    }

    #[test]
    fn failed_storage_unlocks_without_a_tick() {
        let mut generator = TickGenerator::new();
        let mut events = receiver();
        let age = generator.request_storage_tick(vec![key()]).unwrap();
        let result = generator.on_storage(
            age,
            Err(FlowError::FetchFailed {
                resource: "storage",
                context: "denied".into(),
            }),
            &mut events,
        );
        assert!(result.is_none());
        assert!(!generator.is_awaiting_storage());
        assert!(matches!(
            generator.drain_events().next(),
            Some(GeneratorEvent::Error(FlowError::FetchFailed { .. }))
        ));
        assert!(generator.set_next_age(Age::new(3)).is_ok());
    }
}
