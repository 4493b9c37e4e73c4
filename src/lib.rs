//! # Lockstep Flow
//!
//! Lockstep Flow is the synchronization core of a deterministic lockstep simulation runtime.
//! It turns an irregular stream of wall-clock callbacks and a remote, possibly lagging and
//! possibly gapped log of simulation steps ("ticks") into a deterministic sequence of simulation
//! advances, identical on the authoritative producer ([`ExecutionMode::Active`]) and on every
//! passive consumer ([`ExecutionMode::Passive`]).
//!
//! Like the rest of this family of libraries, the API is request driven rather than callback
//! driven: the remote channel is a [`NonBlockingFlow`] that the loop polls once per external
//! callback, and every request the core wants to make is queued and flushed through it.

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use builder::GameLoopBuilder;
pub use clock::{Clock, FrameArgs};
pub use config::{ClockConfig, LoopConfig, TickBufferConfig};
pub use error::{FlowError, FlowResult};
pub use event::{Event, EventCode, EventFlags, EventKind};
pub use event_buffer::{EventBuffer, EventBufferMode, FilterController, FilterId};
pub use flow::messages::{FlowMessage, FlowPermission, FlowRequest, StartPointQuery, StorageTicket};
pub use game_loop::{GameLoop, Step, StepContext};
pub use signal::{Signal, SubscriptionId};
pub use storage::{
    LoaderId, StorageEntry, StorageKey, StorageLoaded, StoragePutOption, StorageRegion,
    StorageValue, StorageValueStore,
};
pub use tick::{SnapshotData, StartPoint, StartPointData, Tick, TickList};

#[cfg(feature = "tokio")]
pub use driver::LoopDriver;

pub mod builder;
pub mod clock;
pub mod config;
#[doc(hidden)]
pub mod error;
pub mod event;
pub mod event_buffer;
pub mod game_loop;
pub mod prelude;
pub mod signal;
pub mod storage;
pub mod telemetry;
pub mod tick;

/// Optional tokio-based periodic callback source.
#[cfg(feature = "tokio")]
pub mod driver;

/// The remote channel boundary: request/message types and their binary codec.
pub mod flow {
    /// Binary codec for flow payloads.
    ///
    /// Provides centralized encoding and decoding of ticks, tick lists, events and start
    /// points using bincode, for implementors of [`NonBlockingFlow`](crate::NonBlockingFlow).
    pub mod codec;
    pub mod messages;
}

/// Tick production and consumption components.
///
/// These are composed by [`TickController`](ticks::tick_controller::TickController); most users
/// only interact with them through [`GameLoop`](crate::GameLoop).
pub mod ticks {
    pub mod join_resolver;
    pub mod storage_resolver;
    pub mod tick_buffer;
    pub mod tick_controller;
    pub mod tick_generator;
}

/// Internal module exposing implementation details for testing and fuzzing.
///
/// # ⚠️ WARNING: No Stability Guarantees
///
/// **This module is NOT part of the public API.** Everything here is subject to change without
/// notice and is intended ONLY for property-based testing, fuzzing and integration testing of
/// the individual components (tick log, join FIFO, generator) in isolation.
#[doc(hidden)]
pub mod __internal {
    pub use crate::ticks::join_resolver::JoinResolver;
    pub use crate::ticks::storage_resolver::StorageResolver;
    pub use crate::ticks::tick_buffer::{TickBuffer, TickBufferEvent, TickRange};
    pub use crate::ticks::tick_controller::{ControllerEvent, TickController};
    pub use crate::ticks::tick_generator::{GeneratorEvent, TickGenerator};
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no age / invalid age.
pub const NULL_AGE: i64 = -1;

/// An age is the index of a single simulation step.
///
/// Ages start at 0 and advance by exactly one per consumed tick. The special value
/// [`Age::NULL`] (-1) represents "no age" (e.g. the latest known age of an empty log).
///
/// # Examples
///
/// ```
/// use lockstep_flow::Age;
///
/// let age = Age::new(0);
/// assert!(age.is_valid());
/// assert!(Age::NULL.is_null());
///
/// let next = age + 1;
/// assert_eq!(next.as_i64(), 1);
/// assert_eq!(next - age, 1);
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Age(i64);

impl Age {
    /// The null age constant, representing "no age".
    pub const NULL: Age = Age(NULL_AGE);

    /// Creates a new `Age` from an `i64` value. The value is not validated.
    #[inline]
    #[must_use]
    pub const fn new(age: i64) -> Self {
        Age(age)
    }

    /// Returns the underlying `i64` value.
    #[inline]
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns `true` if this is [`Age::NULL`].
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_AGE
    }

    /// Returns `true` if this age is non-negative.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns `Some(self)` if the age is valid, or `None` otherwise.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Age> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Age {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_AGE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i64> for Age {
    type Output = Age;

    #[inline]
    fn add(self, rhs: i64) -> Self::Output {
        Age(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i64> for Age {
    #[inline]
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i64> for Age {
    type Output = Age;

    #[inline]
    fn sub(self, rhs: i64) -> Self::Output {
        Age(self.0 - rhs)
    }
}

impl std::ops::Sub<Age> for Age {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: Age) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i64> for Age {
    #[inline]
    fn from(value: i64) -> Self {
        Age(value)
    }
}

impl From<Age> for i64 {
    #[inline]
    fn from(age: Age) -> Self {
        age.0
    }
}

impl PartialEq<i64> for Age {
    #[inline]
    fn eq(&self, other: &i64) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<i64> for Age {
    #[inline]
    fn partial_cmp(&self, other: &i64) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// Identifies a participant. Opaque to the core; assigned by the flow's authentication.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct PlayerId(String);

impl PlayerId {
    /// Creates a new `PlayerId`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        PlayerId(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(value: &str) -> Self {
        PlayerId(value.to_owned())
    }
}

// #############
// #   ENUMS   #
// #############

/// The role of this participant.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Generates ticks authoritatively and transmits them.
    Active,
    /// Only receives and replays ticks produced elsewhere.
    #[default]
    Passive,
}

/// What "catching up" means for the loop.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoopMode {
    /// Follow the latest known age.
    #[default]
    Realtime,
    /// Follow an explicit target age or a target time function.
    Replay,
    /// Never advance autonomously; ages are stepped with [`GameLoop::advance_frame`].
    FrameByFrame,
}

/// How a scene relates to the remote tick stream.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SceneLocalMode {
    /// The scene runs entirely locally, one local step per frame, ignoring the tick stream.
    FullLocal,
    /// The scene only advances on remote ticks.
    #[default]
    NonLocal,
    /// The scene advances on remote ticks and interpolates local steps while waiting for them.
    InterpolateLocal,
}

/// How ticks are generated while a scene is active.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TickGenerationMode {
    /// One tick per clock frame.
    #[default]
    ByClock,
    /// Ticks are only generated when the simulation raises one explicitly.
    Manual,
}

/// The dispatch-relevant properties of the currently running scene.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SceneMode {
    /// Local/remote relationship.
    pub local: SceneLocalMode,
    /// Tick generation policy.
    pub tick_generation: TickGenerationMode,
}

impl SceneMode {
    /// Creates a new `SceneMode`.
    #[must_use]
    pub const fn new(local: SceneLocalMode, tick_generation: TickGenerationMode) -> Self {
        Self {
            local,
            tick_generation,
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// This [`NonBlockingFlow`] trait is the remote channel the loop talks to.
///
/// However you wish to transport ticks, events, storage values and start points, it should be
/// implemented through these two methods. Every request is answered (if at all) by a
/// [`FlowMessage`] returned from a later call to [`receive_all`](NonBlockingFlow::receive_all);
/// responses carry enough of the original request to be correlated without any bookkeeping
/// on the implementor's side.
pub trait NonBlockingFlow {
    /// Queues a request for the remote side.
    fn send(&mut self, request: FlowRequest);

    /// Returns all messages received since the last time this method was called.
    fn receive_all(&mut self) -> Vec<FlowMessage>;
}

/// The simulation driven by the loop.
///
/// The loop never inspects simulation state; it only advances it step by step, restores it from
/// start points, and hands it the storage values it asked for.
pub trait Simulation {
    /// Advances the simulation by one step. Returns `true` if the step changed the scene.
    fn tick(&mut self, ctx: &mut StepContext<'_>, step: Step) -> bool;

    /// Restores the simulation to the state recorded in `start_point`.
    fn restore(&mut self, start_point: &StartPoint) -> FlowResult<()>;

    /// Dispatch properties of the current scene.
    fn scene_mode(&self) -> SceneMode;

    /// The age the simulation will process next.
    fn age(&self) -> Age;

    /// Nominal steps per second.
    fn fps(&self) -> f64;

    /// Delivers storage values requested through [`StepContext::storage_get`].
    fn on_storage_loaded(&mut self, _loaded: StorageLoaded) {}
}
