//! Simulation events.
//!
//! An [`Event`] is a closed sum type over the event kinds the runtime knows about, plus the
//! fields every kind shares (flags, player, local marker). Decoding from the numeric
//! discriminant happens once, at the ingress boundary, through [`EventCode`].

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::storage::StorageEntry;
use crate::PlayerId;

/// Numeric discriminant of an event kind as carried on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventCode {
    /// A participant joined.
    Join = 0,
    /// A participant left.
    Leave = 1,
    /// Wall-clock time of the tick carrying it.
    Timestamp = 2,
    /// Participant metadata changed.
    PlayerInfo = 3,
    /// Arbitrary message payload.
    Message = 32,
    /// Pointer pressed.
    PointDown = 33,
    /// Pointer moved while pressed.
    PointMove = 34,
    /// Pointer released.
    PointUp = 35,
    /// Application-defined operation.
    Operation = 64,
}

impl TryFrom<u8> for EventCode {
    type Error = FlowError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => EventCode::Join,
            1 => EventCode::Leave,
            2 => EventCode::Timestamp,
            3 => EventCode::PlayerInfo,
            32 => EventCode::Message,
            33 => EventCode::PointDown,
            34 => EventCode::PointMove,
            35 => EventCode::PointUp,
            64 => EventCode::Operation,
            code => return Err(FlowError::UnknownEventCode { code }),
        })
    }
}

impl From<EventCode> for u8 {
    fn from(code: EventCode) -> Self {
        code as u8
    }
}

/// Priority and flag bits of an event.
///
/// Bits 0-1 hold the priority (0..=3); bit 3 marks the event as ignorable, meaning it may be
/// left out of tick-range fetches that only care about state-relevant data.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFlags(u8);

impl EventFlags {
    /// Mask of the priority bits.
    pub const PRIORITY_MASK: u8 = 0b0011;
    /// The ignorable bit.
    pub const IGNORABLE: u8 = 0b1000;
    /// Highest representable priority.
    pub const MAX_PRIORITY: u8 = Self::PRIORITY_MASK;

    /// Creates flags from a priority (masked) and the ignorable bit.
    #[must_use]
    pub const fn new(priority: u8, ignorable: bool) -> Self {
        let bits = priority & Self::PRIORITY_MASK;
        EventFlags(if ignorable { bits | Self::IGNORABLE } else { bits })
    }

    /// Creates flags from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        EventFlags(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// The priority part.
    #[must_use]
    pub const fn priority(self) -> u8 {
        self.0 & Self::PRIORITY_MASK
    }

    /// Whether the ignorable bit is set.
    #[must_use]
    pub const fn is_ignorable(self) -> bool {
        self.0 & Self::IGNORABLE != 0
    }

    /// Returns a copy with the priority replaced, keeping the other bits.
    #[must_use]
    pub const fn with_priority(self, priority: u8) -> Self {
        EventFlags((self.0 & !Self::PRIORITY_MASK) | (priority & Self::PRIORITY_MASK))
    }
}

/// Pointer coordinates shared by the point event kinds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPosition {
    /// Pointer identifier (multi-touch).
    pub point_id: u32,
    /// X coordinate.
    pub x: f64,
    /// Y coordinate.
    pub y: f64,
    /// The entity under the pointer, if any.
    pub entity_id: Option<u64>,
}

/// Movement deltas of a pressed pointer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointDelta {
    /// X offset from the press position.
    pub start_delta_x: f64,
    /// Y offset from the press position.
    pub start_delta_y: f64,
    /// X offset from the previous event.
    pub prev_delta_x: f64,
    /// Y offset from the previous event.
    pub prev_delta_y: f64,
}

/// Kind-specific payload of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A participant joined. `storage` is filled in once the join's storage keys resolve.
    Join {
        /// Display name.
        name: Option<String>,
        /// Resolved storage values for the joining participant.
        storage: Option<Vec<StorageEntry>>,
    },
    /// A participant left.
    Leave,
    /// Wall-clock time in milliseconds.
    Timestamp {
        /// Milliseconds, absolute or relative to the session origin.
        timestamp: f64,
    },
    /// Participant metadata.
    PlayerInfo {
        /// Display name.
        name: Option<String>,
        /// Opaque user data.
        user_data: Option<Vec<u8>>,
    },
    /// Arbitrary message.
    Message {
        /// Opaque payload.
        data: Vec<u8>,
    },
    /// Pointer pressed.
    PointDown(PointPosition),
    /// Pointer moved.
    PointMove(PointPosition, PointDelta),
    /// Pointer released.
    PointUp(PointPosition, PointDelta),
    /// Application-defined operation.
    Operation {
        /// Operation code.
        code: u32,
        /// Opaque arguments.
        data: Vec<u8>,
    },
}

impl EventKind {
    /// The discriminant of this kind.
    #[must_use]
    pub const fn code(&self) -> EventCode {
        match self {
            EventKind::Join { .. } => EventCode::Join,
            EventKind::Leave => EventCode::Leave,
            EventKind::Timestamp { .. } => EventCode::Timestamp,
            EventKind::PlayerInfo { .. } => EventCode::PlayerInfo,
            EventKind::Message { .. } => EventCode::Message,
            EventKind::PointDown(_) => EventCode::PointDown,
            EventKind::PointMove(..) => EventCode::PointMove,
            EventKind::PointUp(..) => EventCode::PointUp,
            EventKind::Operation { .. } => EventCode::Operation,
        }
    }
}

/// A single simulation event.
///
/// `flags` is `None` until a priority is assigned; the event buffer fills in its default
/// priority before forwarding. Events with `local == true` never leave this participant.
///
/// # Example
///
/// ```
/// use lockstep_flow::{Event, EventCode, EventKind, PlayerId};
///
/// let event = Event::new(EventKind::Message { data: vec![1, 2, 3] })
///     .with_player(PlayerId::from("p1"))
///     .with_priority(1);
/// assert_eq!(event.code(), EventCode::Message);
/// assert_eq!(event.priority(), Some(1));
/// assert!(!event.local);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Kind-specific payload.
    pub kind: EventKind,
    /// Priority and flag bits, if assigned.
    pub flags: Option<EventFlags>,
    /// Originating participant.
    pub player_id: Option<PlayerId>,
    /// Local events never cross the remote channel.
    pub local: bool,
}

impl Event {
    /// Creates a non-local event with no flags and no player.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            flags: None,
            player_id: None,
            local: false,
        }
    }

    /// Join event for `player`.
    #[must_use]
    pub fn join(player: PlayerId, name: Option<String>) -> Self {
        Self::new(EventKind::Join {
            name,
            storage: None,
        })
        .with_player(player)
    }

    /// Leave event for `player`.
    #[must_use]
    pub fn leave(player: PlayerId) -> Self {
        Self::new(EventKind::Leave).with_player(player)
    }

    /// Timestamp event.
    #[must_use]
    pub fn timestamp(timestamp: f64) -> Self {
        Self::new(EventKind::Timestamp { timestamp })
    }

    /// Sets the originating player.
    #[must_use]
    pub fn with_player(mut self, player: PlayerId) -> Self {
        self.player_id = Some(player);
        self
    }

    /// Sets the priority, keeping other flag bits.
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.flags = Some(self.flags.unwrap_or_default().with_priority(priority));
        self
    }

    /// Marks the event ignorable.
    #[must_use]
    pub fn ignorable(mut self) -> Self {
        let flags = self.flags.unwrap_or_default();
        self.flags = Some(EventFlags::from_bits(flags.bits() | EventFlags::IGNORABLE));
        self
    }

    /// Marks the event local.
    #[must_use]
    pub fn into_local(mut self) -> Self {
        self.local = true;
        self
    }

    /// The discriminant of this event.
    #[must_use]
    pub const fn code(&self) -> EventCode {
        self.kind.code()
    }

    /// The assigned priority, if any.
    #[must_use]
    pub fn priority(&self) -> Option<u8> {
        self.flags.map(EventFlags::priority)
    }

    /// Whether the event may be dropped from state-only fetches.
    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        self.flags.is_some_and(EventFlags::is_ignorable)
    }

    /// Join and Leave events are resolved through the join pipeline.
    #[must_use]
    pub const fn is_join_or_leave(&self) -> bool {
        matches!(self.kind, EventKind::Join { .. } | EventKind::Leave)
    }

    /// The timestamp carried by a Timestamp event.
    #[must_use]
    pub const fn timestamp_value(&self) -> Option<f64> {
        match self.kind {
            EventKind::Timestamp { timestamp } => Some(timestamp),
            _ => None,
        }
    }
}
