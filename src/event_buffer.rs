//! Inbound event buffering, filtering and routing.
//!
//! The [`EventBuffer`] sits between the event sources (user input, the remote channel, the
//! simulation itself) and three read-once queues: local events, join/leave events and all other
//! non-local events. Events pass through an ordered filter chain on
//! [`process_events`](EventBuffer::process_events) before they are routed.

use std::collections::{BTreeMap, VecDeque};

use crate::event::Event;
use crate::flow::messages::{FlowPermission, FlowRequest};
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Switches governing which event classes are buffered and forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBufferMode {
    /// Buffer local events.
    pub is_local_receiver: bool,
    /// Buffer non-local events.
    pub is_receiver: bool,
    /// Forward non-local events to the remote channel.
    pub is_sender: bool,
    /// Buffer nothing (forwarding is unaffected).
    pub is_discarder: bool,
    /// Priority assigned to forwarded events that have none.
    pub default_event_priority: u8,
}

impl Default for EventBufferMode {
    fn default() -> Self {
        Self {
            is_local_receiver: true,
            is_receiver: false,
            is_sender: false,
            is_discarder: false,
            default_event_priority: 0,
        }
    }
}

/// Handle returned by [`EventBuffer::add_filter`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId(u64);

/// Passed to filters so they can defer events to the next pass.
#[derive(Debug, Default)]
pub struct FilterController {
    deferred: Vec<Event>,
}

impl FilterController {
    /// Emits `event` on the next call to [`EventBuffer::process_events`] instead of now.
    pub fn process_next(&mut self, event: Event) {
        self.deferred.push(event);
    }
}

type FilterFn = Box<dyn FnMut(Vec<Event>, &mut FilterController) -> Option<Vec<Event>>>;

struct Filter {
    func: FilterFn,
    handle_empty: bool,
}

/// Buffers, filters and routes events.
///
/// # Example
///
/// ```
/// use lockstep_flow::{Event, EventBuffer, EventBufferMode, EventKind, FlowPermission};
///
/// let mut buffer = EventBuffer::new(FlowPermission::active());
/// buffer.set_mode(EventBufferMode { is_receiver: true, ..EventBufferMode::default() });
///
/// buffer.on_event(Event::new(EventKind::Message { data: vec![1] }));
/// assert!(buffer.read_events().is_none(), "nothing is routed before processing");
///
/// buffer.process_events(false);
/// assert_eq!(buffer.read_events().map(|events| events.len()), Some(1));
/// assert!(buffer.read_events().is_none());
/// ```
pub struct EventBuffer {
    mode: EventBufferMode,
    permission: FlowPermission,
    skipping: bool,
    unfiltered_local_events: Vec<Event>,
    unfiltered_events: Vec<Event>,
    deferred_events: Vec<Event>,
    local_events: Vec<Event>,
    join_leave_events: Vec<Event>,
    events: Vec<Event>,
    filters: BTreeMap<FilterId, Filter>,
    next_filter_id: u64,
    outbox: VecDeque<FlowRequest>,
}

impl EventBuffer {
    /// Creates a buffer in the default mode (local receiver only).
    #[must_use]
    pub fn new(permission: FlowPermission) -> Self {
        Self {
            mode: EventBufferMode::default(),
            permission,
            skipping: false,
            unfiltered_local_events: Vec::new(),
            unfiltered_events: Vec::new(),
            deferred_events: Vec::new(),
            local_events: Vec::new(),
            join_leave_events: Vec::new(),
            events: Vec::new(),
            filters: BTreeMap::new(),
            next_filter_id: 0,
            outbox: VecDeque::new(),
        }
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> EventBufferMode {
        self.mode
    }

    /// Replaces the mode. Events buffered before are kept; events dropped before are not
    /// recovered.
    pub fn set_mode(&mut self, mode: EventBufferMode) {
        if mode.default_event_priority > self.permission.max_event_priority {
            crate::report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::EventBuffer,
                "default event priority {} exceeds permitted {}; clamping",
                mode.default_event_priority,
                self.permission.max_event_priority
            );
        }
        self.mode = mode;
    }

    /// The permission set used to gate and clamp forwarding.
    #[must_use]
    pub fn permission(&self) -> FlowPermission {
        self.permission
    }

    /// Whether the skipping state is active.
    #[must_use]
    pub fn is_skipping(&self) -> bool {
        self.skipping
    }

    /// Enters the skipping state: external input is discarded until
    /// [`stop_skipping`](Self::stop_skipping).
    pub fn start_skipping(&mut self) {
        self.skipping = true;
    }

    /// Leaves the skipping state.
    pub fn stop_skipping(&mut self) {
        self.skipping = false;
    }

    /// Ingests an event from an external source (user input or the simulation).
    ///
    /// Discarded while skipping. Local events are buffered only for a local receiver and never
    /// forwarded. Non-local events are buffered for a receiver and forwarded for a sender.
    pub fn on_event(&mut self, event: Event) {
        if self.skipping {
            tracing::trace!(code = ?event.code(), "discarding event while skipping");
            return;
        }
        if event.local {
            if self.accepts_local() {
                self.unfiltered_local_events.push(event);
            }
            return;
        }
        if self.accepts_non_local() {
            self.unfiltered_events.push(event.clone());
        }
        self.forward(event);
    }

    /// Ingests a non-local event delivered by the remote channel. Never forwarded back.
    pub fn on_remote_event(&mut self, event: Event) {
        if event.local {
            crate::report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::EventBuffer,
                "remote channel delivered a local event; dropping"
            );
            return;
        }
        if self.accepts_non_local() {
            self.unfiltered_events.push(event);
        }
    }

    /// Like [`on_event`](Self::on_event) but bypasses the filter chain and the skipping state.
    pub fn add_event_direct(&mut self, event: Event) {
        if event.local {
            if self.accepts_local() {
                self.route(event);
            }
            return;
        }
        if self.accepts_non_local() {
            self.route(event.clone());
        }
        self.forward(event);
    }

    /// Registers a filter at the end of the chain.
    ///
    /// A filter receives the current sequence and returns its replacement; `None` means empty.
    /// It is skipped for an empty sequence unless `handle_empty` is set.
    pub fn add_filter(
        &mut self,
        func: impl FnMut(Vec<Event>, &mut FilterController) -> Option<Vec<Event>> + 'static,
        handle_empty: bool,
    ) -> FilterId {
        let id = FilterId(self.next_filter_id);
        self.next_filter_id += 1;
        self.filters.insert(
            id,
            Filter {
                func: Box::new(func),
                handle_empty,
            },
        );
        id
    }

    /// Removes a filter. Returns `false` if it was not registered.
    pub fn remove_filter(&mut self, id: FilterId) -> bool {
        self.filters.remove(&id).is_some()
    }

    /// Removes every filter.
    pub fn remove_all_filters(&mut self) {
        self.filters.clear();
    }

    /// Runs buffered events through the filter chain and routes the result.
    ///
    /// Events deferred by a filter on the previous pass are routed first, as they were. Then the
    /// unfiltered local events and, unless `local_only`, the unfiltered non-local events (local
    /// first) are filtered and routed.
    pub fn process_events(&mut self, local_only: bool) {
        for event in std::mem::take(&mut self.deferred_events) {
            self.route(event);
        }

        let mut events = std::mem::take(&mut self.unfiltered_local_events);
        if !local_only {
            events.append(&mut self.unfiltered_events);
        }

        let mut controller = FilterController::default();
        for filter in self.filters.values_mut() {
            if events.is_empty() && !filter.handle_empty {
                continue;
            }
            events = (filter.func)(events, &mut controller).unwrap_or_default();
        }
        self.deferred_events = controller.deferred;

        for event in events {
            self.route(event);
        }
    }

    /// Drains routed non-local events other than joins and leaves.
    pub fn read_events(&mut self) -> Option<Vec<Event>> {
        take_non_empty(&mut self.events)
    }

    /// Drains routed join and leave events.
    pub fn read_join_leaves(&mut self) -> Option<Vec<Event>> {
        take_non_empty(&mut self.join_leave_events)
    }

    /// Drains routed local events.
    pub fn read_local_events(&mut self) -> Option<Vec<Event>> {
        take_non_empty(&mut self.local_events)
    }

    /// Drains requests for the remote channel.
    pub fn drain_requests(&mut self) -> std::collections::vec_deque::Drain<'_, FlowRequest> {
        self.outbox.drain(..)
    }

    fn accepts_local(&self) -> bool {
        self.mode.is_local_receiver && !self.mode.is_discarder
    }

    fn accepts_non_local(&self) -> bool {
        self.mode.is_receiver && !self.mode.is_discarder
    }

    fn forward(&mut self, mut event: Event) {
        if !self.mode.is_sender {
            return;
        }
        if !self.permission.send_event {
            crate::report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::EventBuffer,
                "sender mode without send permission; event not forwarded"
            );
            return;
        }
        let max = self.permission.max_event_priority;
        let priority = event
            .priority()
            .unwrap_or(self.mode.default_event_priority)
            .min(max);
        event = event.with_priority(priority);
        self.outbox.push_back(FlowRequest::SendEvent(event));
    }

    fn route(&mut self, event: Event) {
        if event.is_join_or_leave() {
            self.join_leave_events.push(event);
        } else if event.local {
            self.local_events.push(event);
        } else {
            self.events.push(event);
        }
    }
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("mode", &self.mode)
            .field("skipping", &self.skipping)
            .field("filters", &self.filters.len())
            .field("unfiltered_local", &self.unfiltered_local_events.len())
            .field("unfiltered", &self.unfiltered_events.len())
            .finish_non_exhaustive()
    }
}

fn take_non_empty(queue: &mut Vec<Event>) -> Option<Vec<Event>> {
    if queue.is_empty() {
        None
    } else {
        Some(std::mem::take(queue))
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
    use crate::PlayerId;

    fn message(tag: u8) -> Event {
        Event::new(EventKind::Message { data: vec![tag] })
    }

    fn receiver() -> EventBuffer {
        let mut buffer = EventBuffer::new(FlowPermission::active());
        buffer.set_mode(EventBufferMode {
            is_receiver: true,
            ..EventBufferMode::default()
        });
        buffer
    }

    fn sender() -> EventBuffer {
        let mut buffer = EventBuffer::new(FlowPermission::passive());
        buffer.set_mode(EventBufferMode {
            is_sender: true,
            default_event_priority: 1,
            ..EventBufferMode::default()
        });
        buffer
    }

    #[test]
    fn routes_by_kind() {
        let mut buffer = receiver();
        buffer.on_event(message(1));
        buffer.on_event(Event::join(PlayerId::from("p"), None));
        buffer.on_event(message(2).into_local());
        buffer.process_events(false);

        assert_eq!(buffer.read_events(), Some(vec![message(1)]));
        assert_eq!(buffer.read_join_leaves().unwrap().len(), 1);
        assert_eq!(buffer.read_local_events(), Some(vec![message(2).into_local()]));
        assert!(buffer.read_events().is_none());
    }

    #[test]
    fn local_only_pass_leaves_non_local_events_buffered() {
        let mut buffer = receiver();
        buffer.on_event(message(1));
        buffer.on_event(message(2).into_local());
        buffer.process_events(true);
        assert!(buffer.read_events().is_none());
        assert!(buffer.read_local_events().is_some());

        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(1)]));
    }

    #[test]
    fn sender_assigns_default_priority_and_clamps() {
        let mut buffer = sender();
        buffer.on_event(message(1));
        buffer.on_event(message(2).with_priority(3));
        let sent: Vec<_> = buffer.drain_requests().collect();
        assert_eq!(sent.len(), 2);
        let FlowRequest::SendEvent(first) = &sent[0] else {
            panic!("expected SendEvent");
        };
        assert_eq!(first.priority(), Some(1));
        let FlowRequest::SendEvent(second) = &sent[1] else {
            panic!("expected SendEvent");
        };
        assert_eq!(second.priority(), Some(2));

        // Not a receiver: nothing buffered.
        buffer.process_events(false);
        assert!(buffer.read_events().is_none());
    }

    #[test]
    fn local_events_are_never_sent() {
        let mut buffer = sender();
        buffer.on_event(message(1).into_local());
        buffer.add_event_direct(message(2).into_local());
        assert_eq!(buffer.drain_requests().count(), 0);
    }

    #[test]
    fn send_requires_permission() {
        let mut buffer = EventBuffer::new(FlowPermission::observer());
        buffer.set_mode(EventBufferMode {
            is_sender: true,
            ..EventBufferMode::default()
        });
        buffer.on_event(message(1));
        assert_eq!(buffer.drain_requests().count(), 0);
    }

    #[test]
    fn discarder_buffers_nothing_but_still_forwards() {
        let mut buffer = sender();
        let mut mode = buffer.mode();
        mode.is_receiver = true;
        mode.is_discarder = true;
        buffer.set_mode(mode);
        buffer.on_event(message(1));
        buffer.on_event(message(2).into_local());
        buffer.process_events(false);
        assert!(buffer.read_events().is_none());
        assert!(buffer.read_local_events().is_none());
        assert_eq!(buffer.drain_requests().count(), 1);
    }

    #[test]
    fn toggling_local_receiver_does_not_redeliver() {
        let mut buffer = receiver();
        let mut mode = buffer.mode();
        mode.is_local_receiver = false;
        buffer.set_mode(mode);
        buffer.on_event(message(1).into_local());
        mode.is_local_receiver = true;
        buffer.set_mode(mode);
        buffer.process_events(false);
        assert!(buffer.read_local_events().is_none());
    }

    #[test]
    fn skipping_discards_external_input_only() {
        let mut buffer = receiver();
        buffer.start_skipping();
        buffer.on_event(message(1));
        buffer.on_remote_event(message(2));
        buffer.add_event_direct(message(3));
        buffer.stop_skipping();
        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(3), message(2)]));
    }

    #[test]
    fn filters_run_in_registration_order() {
        let mut buffer = receiver();
        buffer.add_filter(
            |mut events, _| {
                events.push(message(9));
                Some(events)
            },
            false,
        );
        buffer.add_filter(|events, _| Some(events.into_iter().rev().collect()), false);
        buffer.on_event(message(1));
        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(9), message(1)]));
    }

    #[test]
    fn filters_skip_empty_input_unless_requested() {
        let mut buffer = receiver();
        buffer.add_filter(|_, _| Some(vec![message(5)]), false);
        buffer.process_events(false);
        assert!(buffer.read_events().is_none());

        let id = buffer.add_filter(
            |mut events, _| {
                events.push(message(6));
                Some(events)
            },
            true,
        );
        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(6)]));

        assert!(buffer.remove_filter(id));
        assert!(!buffer.remove_filter(id));
    }

    #[test]
    fn none_from_a_filter_means_empty() {
        let mut buffer = receiver();
        buffer.add_filter(|_, _| None, false);
        buffer.on_event(message(1));
        buffer.process_events(false);
        assert!(buffer.read_events().is_none());
    }

    #[test]
    fn deferred_events_come_out_on_the_next_pass() {
        let mut buffer = receiver();
        buffer.add_filter(
            |events, controller| {
                let mut kept = Vec::new();
                for event in events {
                    if event == message(2) {
                        controller.process_next(event);
                    } else {
                        kept.push(event);
                    }
                }
                Some(kept)
            },
            false,
        );
        buffer.on_event(message(1));
        buffer.on_event(message(2));
        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(1)]));

        buffer.on_event(message(3));
        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(2), message(3)]));
    }

    #[test]
    fn direct_events_bypass_filters() {
        let mut buffer = receiver();
        buffer.add_filter(|_, _| None, true);
        buffer.add_event_direct(message(1));
        buffer.process_events(false);
        assert_eq!(buffer.read_events(), Some(vec![message(1)]));
    }
}
