//! Convenient re-exports for common usage.
//!
//! This module provides a "prelude" that re-exports the types most integrations need: the loop
//! and its builder, the two traits to implement, and the data that crosses the flow boundary.
//!
//! # Usage
//!
//! ```rust
//! use lockstep_flow::prelude::*;
//! ```
//!
//! # What's Included
//!
//! - **Loop types**: [`GameLoop`], [`GameLoopBuilder`], [`Step`], [`StepContext`]
//! - **Core traits**: [`Simulation`], [`NonBlockingFlow`]
//! - **Fundamental types**: [`Age`], [`PlayerId`], [`ExecutionMode`], [`LoopMode`], [`SceneMode`]
//! - **Flow boundary**: [`FlowRequest`], [`FlowMessage`], [`FlowPermission`], [`Tick`],
//!   [`TickList`], [`StartPoint`], [`Event`]
//! - **Error handling**: [`FlowError`], [`FlowResult`]
//! - **Configuration**: [`ClockConfig`], [`LoopConfig`], [`TickBufferConfig`]

// Loop types
pub use crate::builder::GameLoopBuilder;
pub use crate::game_loop::{GameLoop, Step, StepContext};

// Core traits
pub use crate::{NonBlockingFlow, Simulation};

// Fundamental types and constants
pub use crate::{
    Age, ExecutionMode, LoopMode, PlayerId, SceneLocalMode, SceneMode, TickGenerationMode,
    NULL_AGE,
};

// Flow boundary
pub use crate::event::{Event, EventKind};
pub use crate::flow::messages::{FlowMessage, FlowPermission, FlowRequest, StartPointQuery};
pub use crate::storage::{StorageKey, StorageLoaded, StorageRegion, StorageValue};
pub use crate::tick::{SnapshotData, StartPoint, StartPointData, Tick, TickList};

// Error handling
pub use crate::error::{FlowError, FlowResult};

// Common configuration types
pub use crate::config::{ClockConfig, LoopConfig, TickBufferConfig};
