//! Requests sent to and messages received from a [`NonBlockingFlow`](crate::NonBlockingFlow).

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::event::Event;
use crate::storage::{StorageEntry, StorageKey, StoragePutOption, StorageValue};
use crate::tick::{StartPoint, Tick, TickList};
use crate::Age;

/// Capabilities granted to this participant at authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowPermission {
    /// May fetch and subscribe to ticks.
    pub read_tick: bool,
    /// May push ticks (required for [`ExecutionMode::Active`](crate::ExecutionMode::Active)).
    pub write_tick: bool,
    /// May publish events.
    pub send_event: bool,
    /// May subscribe to events.
    pub subscribe_event: bool,
    /// Highest priority this participant may assign to its events.
    pub max_event_priority: u8,
}

impl FlowPermission {
    /// Permissions of an authoritative producer.
    #[must_use]
    pub const fn active() -> Self {
        Self {
            read_tick: true,
            write_tick: true,
            send_event: false,
            subscribe_event: true,
            max_event_priority: 2,
        }
    }

    /// Permissions of a playing consumer.
    #[must_use]
    pub const fn passive() -> Self {
        Self {
            read_tick: true,
            write_tick: false,
            send_event: true,
            subscribe_event: false,
            max_event_priority: 2,
        }
    }

    /// Permissions of a read-only observer.
    #[must_use]
    pub const fn observer() -> Self {
        Self {
            read_tick: true,
            write_tick: false,
            send_event: false,
            subscribe_event: false,
            max_event_priority: 0,
        }
    }
}

impl Default for FlowPermission {
    fn default() -> Self {
        Self::passive()
    }
}

/// Correlates a storage response with the component that asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageTicket {
    /// Requested by the tick generator; the values are embedded in the tick at `age`.
    TickGeneration {
        /// The age the values are bound to.
        age: Age,
    },
    /// Requested by the join resolver for the join with this sequence number.
    Join {
        /// Join request sequence number.
        sequence: u64,
    },
}

/// How a start point is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StartPointQuery {
    /// Nearest start point at or before this age. `Age::new(0)` yields the root.
    Age(Age),
    /// Nearest start point at or before this timestamp.
    Timestamp(f64),
}

/// Requests the core sends through the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowRequest {
    /// Publish a generated tick.
    PushTick(Tick),
    /// Publish a non-local event.
    SendEvent(Event),
    /// Fetch ticks in `[begin, end)`.
    FetchTicks {
        /// First age.
        begin: Age,
        /// One past the last age.
        end: Age,
        /// Leave ignorable events out of the response.
        exclude_ignorable: bool,
    },
    /// Fetch storage values.
    GetStorage {
        /// Correlation ticket echoed in the response.
        ticket: StorageTicket,
        /// Keys to fetch.
        keys: Vec<StorageKey>,
    },
    /// Write a storage value.
    PutStorage {
        /// Key.
        key: StorageKey,
        /// Value.
        value: StorageValue,
        /// How to combine with the existing value.
        option: StoragePutOption,
    },
    /// Fetch a start point.
    GetStartPoint {
        /// Lookup.
        query: StartPointQuery,
    },
    /// Store a start point.
    PutStartPoint(StartPoint),
}

/// Messages the flow delivers to the core.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowMessage {
    /// A tick published by the producer.
    Tick(Tick),
    /// A non-local event published by a consumer.
    Event(Event),
    /// Response to [`FlowRequest::FetchTicks`]. `Ok(None)` means no ticks exist in the span.
    TickList {
        /// Requested begin.
        begin: Age,
        /// Requested end.
        end: Age,
        /// The ticks.
        result: Result<Option<TickList>, FlowError>,
    },
    /// Response to [`FlowRequest::GetStorage`].
    Storage {
        /// Echoed ticket.
        ticket: StorageTicket,
        /// The values.
        result: Result<Vec<StorageEntry>, FlowError>,
    },
    /// Response to [`FlowRequest::GetStartPoint`]. `Ok(None)` means no start point matched.
    StartPoint {
        /// Echoed query.
        query: StartPointQuery,
        /// The start point.
        result: Result<Option<StartPoint>, FlowError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_presets() {
        assert!(FlowPermission::active().write_tick);
        assert!(!FlowPermission::passive().write_tick);
        assert!(FlowPermission::passive().send_event);
        assert!(!FlowPermission::observer().send_event);
        assert_eq!(FlowPermission::default(), FlowPermission::passive());
    }
}
