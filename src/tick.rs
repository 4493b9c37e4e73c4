//! Ticks, tick lists and start points.

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::storage::StorageEntry;
use crate::Age;

/// The record of one age: the events applied at that step and, on the single age that
/// resolves a storage request, the fetched storage values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// The age this tick advances.
    pub age: Age,
    /// Events, omitted for frames with no activity.
    pub events: Option<Vec<Event>>,
    /// Storage values resolved at this age.
    pub storage: Option<Vec<StorageEntry>>,
}

impl Tick {
    /// An empty tick.
    #[must_use]
    pub const fn new(age: Age) -> Self {
        Self {
            age,
            events: None,
            storage: None,
        }
    }

    /// Sets the events. An empty list is normalized to `None`.
    #[must_use]
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = (!events.is_empty()).then_some(events);
        self
    }

    /// Sets the storage values.
    #[must_use]
    pub fn with_storage(mut self, storage: Vec<StorageEntry>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// `true` if the tick carries events or storage values.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.events.as_ref().is_some_and(|events| !events.is_empty()) || self.storage.is_some()
    }

    /// Returns a copy without ignorable events.
    #[must_use]
    pub fn without_ignorable(&self) -> Self {
        let events = self.events.as_ref().map(|events| {
            events
                .iter()
                .filter(|event| !event.is_ignorable())
                .cloned()
                .collect::<Vec<_>>()
        });
        Self {
            age: self.age,
            events: events.filter(|events| !events.is_empty()),
            storage: self.storage.clone(),
        }
    }
}

/// A contiguous span of ages `[start, end)` as returned by a tick fetch.
///
/// `ticks` contains only the ages within the span that carry a payload, in increasing age
/// order; every other age in the span is known to be empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickList {
    /// First age of the span.
    pub start: Age,
    /// One past the last age of the span.
    pub end: Age,
    /// Ticks with payload.
    pub ticks: Vec<Tick>,
}

impl TickList {
    /// Creates a tick list.
    #[must_use]
    pub fn new(start: Age, end: Age, ticks: Vec<Tick>) -> Self {
        Self { start, end, ticks }
    }
}

/// Restorable simulation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Serialized random generator.
    pub random_generator: Vec<u8>,
    /// Next entity id to allocate.
    pub next_entity_id: u64,
    /// Opaque simulation snapshot.
    pub snapshot: Vec<u8>,
}

/// Content of a start point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartPointData {
    /// The age-0 root record.
    Root {
        /// Seed of the simulation's random generator.
        seed: u64,
        /// Opaque launch arguments.
        args: Option<Vec<u8>>,
    },
    /// A checkpoint taken during play.
    Snapshot(SnapshotData),
}

/// A resumable simulation state at a given age.
///
/// `frame` is the age of the next tick to apply after restoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPoint {
    /// Age of the next tick after restoring.
    pub frame: Age,
    /// Wall-clock time in milliseconds at `frame`.
    pub timestamp: f64,
    /// Root seed or snapshot.
    pub data: StartPointData,
}

impl StartPoint {
    /// The root start point at age 0.
    #[must_use]
    pub fn root(seed: u64, timestamp: f64) -> Self {
        Self {
            frame: Age::new(0),
            timestamp,
            data: StartPointData::Root { seed, args: None },
        }
    }

    /// `true` for the age-0 root record.
    #[must_use]
    pub fn is_root(&self) -> bool {
        matches!(self.data, StartPointData::Root { .. })
    }
}
