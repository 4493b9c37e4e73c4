//! Common test infrastructure shared across integration tests.
//!
//! This module provides:
//! - `stubs`: an in-memory flow server and a recording simulation
//! - `test_utils`: tracing setup and loop construction helpers
//!
//! # Usage
//!
//! From any integration test file:
//! ```ignore
//! #[path = "common/mod.rs"]
//! mod common;
//! use common::stubs::{MemoryServer, StubSimulation};
//! use common::{passive_loop, FRAME_MS};
//! ```

pub mod stubs;
pub mod test_utils;

// These are public utilities for integration tests - allow unused until tests adopt them.
#[allow(unused_imports)]
pub use test_utils::{
    active_loop, build_loop, init_tracing, passive_loop, run_frames, FRAME_MS, STUB_FPS,
};
