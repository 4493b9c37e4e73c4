//! Configuration types for the clock, the tick log and the game loop.
//!
//! # Overview
//!
//! | Config Type | Purpose | Key Presets |
//! |-------------|---------|-------------|
//! | `ClockConfig` | Frame pacing | `realtime()`, `replay()` |
//! | `TickBufferConfig` | Tick log prefetching | `low_bandwidth()` |
//! | `LoopConfig` | Catch-up and checkpoint policy | `lan()`, `replay()`, `spectator()` |
//!
//! All thresholds in [`LoopConfig`] are expressed in frames. Where the loop compares
//! wall-clock time (time-driven replay), it converts them with the nominal frame time.
//!
//! # Example
//!
//! ```
//! use lockstep_flow::{ClockConfig, LoopConfig};
//! use web_time::Duration;
//!
//! let config = LoopConfig {
//!     polling_interval: Duration::from_secs(2),
//!     ..LoopConfig::lan()
//! };
//! assert!(config.validate().is_ok());
//! assert!(ClockConfig::default().validate().is_ok());
//! ```

use web_time::Duration;

use crate::error::{FlowError, FlowResult};
use crate::event::EventFlags;
use crate::{Age, LoopMode};

/// Configuration of the frame-pacing [`Clock`](crate::Clock).
///
/// # Forward Compatibility
///
/// New fields may be added in future versions. Construct instances with
/// `..ClockConfig::default()`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "ClockConfig has no effect unless passed to GameLoopBuilder::with_clock_config()"]
pub struct ClockConfig {
    /// Nominal frames per second.
    ///
    /// Default: 60
    pub fps: f64,

    /// Multiplier on the effective frame rate (and on `max_frames_per_callback`).
    /// The nominal `fps` is unaffected.
    ///
    /// Default: 1.0
    pub scale_factor: f64,

    /// Maximum frame notifications fired from one external callback, before scaling.
    /// Anything beyond is deferred to later callbacks.
    ///
    /// Default: 8
    pub max_frames_per_callback: u32,

    /// Deltas above this many milliseconds are treated as exactly one frame
    /// (e.g. after the host process slept).
    ///
    /// Default: 150
    pub delta_time_broken_threshold_ms: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            fps: 60.0,
            scale_factor: 1.0,
            max_frames_per_callback: 8,
            delta_time_broken_threshold_ms: 150.0,
        }
    }
}

impl ClockConfig {
    /// Creates a new `ClockConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for live play. Same as the defaults.
    pub fn realtime() -> Self {
        Self::default()
    }

    /// Preset for replays, which tolerate larger bursts per callback.
    pub fn replay() -> Self {
        Self {
            max_frames_per_callback: 16,
            ..Self::default()
        }
    }

    /// Sets `fps`.
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    /// Validates the clock configuration.
    pub fn validate(&self) -> FlowResult<()> {
        if !self.fps.is_finite() || self.fps <= 0.0 || self.fps > 1000.0 {
            return Err(FlowError::InvalidConfig {
                field: "fps",
                reason: format!("must be in (0, 1000], got {}", self.fps),
            });
        }
        if !self.scale_factor.is_finite() || self.scale_factor <= 0.0 {
            return Err(FlowError::InvalidConfig {
                field: "scale_factor",
                reason: format!("must be positive, got {}", self.scale_factor),
            });
        }
        if self.max_frames_per_callback == 0 {
            return Err(FlowError::InvalidConfig {
                field: "max_frames_per_callback",
                reason: "must be at least 1".into(),
            });
        }
        let broken = self.delta_time_broken_threshold_ms;
        if broken.is_nan() || broken <= 0.0 {
            return Err(FlowError::InvalidConfig {
                field: "delta_time_broken_threshold_ms",
                reason: format!(
                    "must be positive, got {}",
                    self.delta_time_broken_threshold_ms
                ),
            });
        }
        Ok(())
    }
}

/// Configuration of the consumer-side tick log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "TickBufferConfig has no effect unless passed to \
              GameLoopBuilder::with_tick_buffer_config()"]
pub struct TickBufferConfig {
    /// When the consumption cursor gets this many ages away from the nearest gap, the next
    /// batch is fetched ahead of time.
    ///
    /// Default: 1800
    pub prefetch_threshold: u32,

    /// Number of ages requested per fetch.
    ///
    /// Default: 600
    pub fetch_batch_size: u32,
}

impl Default for TickBufferConfig {
    fn default() -> Self {
        Self {
            prefetch_threshold: 1800,
            fetch_batch_size: 600,
        }
    }
}

impl TickBufferConfig {
    /// Creates a new `TickBufferConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Smaller, more frequent fetches.
    pub fn low_bandwidth() -> Self {
        Self {
            prefetch_threshold: 300,
            fetch_batch_size: 120,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> FlowResult<()> {
        if self.fetch_batch_size == 0 {
            return Err(FlowError::InvalidConfig {
                field: "fetch_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Catch-up, checkpoint and polling policy of the [`GameLoop`](crate::GameLoop).
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use = "LoopConfig has no effect unless passed to GameLoopBuilder::with_loop_config()"]
pub struct LoopConfig {
    /// What the loop catches up to.
    ///
    /// Default: [`LoopMode::Realtime`]
    pub loop_mode: LoopMode,

    /// Explicit target age for [`LoopMode::Replay`] without a target time function.
    ///
    /// Default: `None`
    pub target_age: Option<Age>,

    /// Offset in milliseconds added to the target time function's result.
    ///
    /// Default: 0
    pub target_time_offset: f64,

    /// Gaps up to this many frames are absorbed one tick per frame.
    ///
    /// Default: 6
    pub delay_ignore_threshold: u32,

    /// Maximum ticks consumed in one frame while catching up.
    ///
    /// Default: 100
    pub skip_ticks_at_once: u32,

    /// Gaps beyond this many frames enter the skip state.
    ///
    /// Default: 100
    pub skip_threshold: u32,

    /// Gaps beyond this many frames request a start point.
    ///
    /// Default: 5400
    pub jump_try_threshold: u32,

    /// Start points less than this many frames ahead of the current position are not worth
    /// jumping to.
    ///
    /// Default: 900
    pub jump_ignore_threshold: u32,

    /// While blocked on a missing tick, re-request ticks at most this often.
    ///
    /// Default: 10s
    pub polling_interval: Duration,

    /// Playback speed; scales the clock.
    ///
    /// Default: 1.0
    pub playback_rate: f64,

    /// In time-driven replay, skip interpolated local steps while catching up.
    ///
    /// Default: true
    pub omit_interpolated_tick_on_replay: bool,

    /// Priority assigned to outgoing events that have none.
    ///
    /// Default: 0
    pub default_event_priority: u8,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Realtime,
            target_age: None,
            target_time_offset: 0.0,
            delay_ignore_threshold: 6,
            skip_ticks_at_once: 100,
            skip_threshold: 100,
            jump_try_threshold: 5400,
            jump_ignore_threshold: 900,
            polling_interval: Duration::from_secs(10),
            playback_rate: 1.0,
            omit_interpolated_tick_on_replay: true,
            default_event_priority: 0,
        }
    }
}

impl LoopConfig {
    /// Creates a new `LoopConfig` with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Low-latency networks: catch up and jump sooner, poll more often.
    pub fn lan() -> Self {
        Self {
            skip_threshold: 30,
            jump_try_threshold: 1800,
            jump_ignore_threshold: 300,
            polling_interval: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Replay of a recorded log towards an explicit target.
    pub fn replay() -> Self {
        Self {
            loop_mode: LoopMode::Replay,
            skip_ticks_at_once: 300,
            ..Self::default()
        }
    }

    /// Live observers, which tolerate more delay before catching up.
    pub fn spectator() -> Self {
        Self {
            delay_ignore_threshold: 12,
            skip_threshold: 200,
            polling_interval: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Validates the loop configuration.
    pub fn validate(&self) -> FlowResult<()> {
        if self.skip_ticks_at_once == 0 {
            return Err(FlowError::InvalidConfig {
                field: "skip_ticks_at_once",
                reason: "must be at least 1".into(),
            });
        }
        if self.jump_ignore_threshold > self.jump_try_threshold {
            return Err(FlowError::InvalidConfig {
                field: "jump_ignore_threshold",
                reason: format!(
                    "{} exceeds jump_try_threshold {}",
                    self.jump_ignore_threshold, self.jump_try_threshold
                ),
            });
        }
        if self.polling_interval < Duration::from_millis(1)
            || self.polling_interval > Duration::from_secs(600)
        {
            return Err(FlowError::InvalidConfig {
                field: "polling_interval",
                reason: format!(
                    "must be within 1ms..=600s, got {}ms",
                    self.polling_interval.as_millis()
                ),
            });
        }
        if !self.playback_rate.is_finite() || self.playback_rate <= 0.0 {
            return Err(FlowError::InvalidConfig {
                field: "playback_rate",
                reason: format!("must be positive, got {}", self.playback_rate),
            });
        }
        if !self.target_time_offset.is_finite() {
            return Err(FlowError::InvalidConfig {
                field: "target_time_offset",
                reason: "must be finite".into(),
            });
        }
        if self.default_event_priority > EventFlags::MAX_PRIORITY {
            return Err(FlowError::InvalidConfig {
                field: "default_event_priority",
                reason: format!(
                    "must be at most {}, got {}",
                    EventFlags::MAX_PRIORITY,
                    self.default_event_priority
                ),
            });
        }
        if let Some(target) = self.target_age {
            if !target.is_valid() {
                return Err(FlowError::InvalidAge {
                    age: target,
                    reason: "target age must be non-negative".into(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ClockConfig::default().validate().is_ok());
        assert!(TickBufferConfig::default().validate().is_ok());
        assert!(LoopConfig::default().validate().is_ok());
    }

    #[test]
    fn presets_validate() {
        for config in [ClockConfig::realtime(), ClockConfig::replay()] {
            assert!(config.validate().is_ok());
        }
        assert!(TickBufferConfig::low_bandwidth().validate().is_ok());
        for config in [LoopConfig::lan(), LoopConfig::replay(), LoopConfig::spectator()] {
            assert!(config.validate().is_ok(), "{config:?}");
        }
        assert_eq!(LoopConfig::replay().loop_mode, LoopMode::Replay);
    }

    #[test]
    fn loop_defaults_match_documented_values() {
        let config = LoopConfig::default();
        assert_eq!(config.delay_ignore_threshold, 6);
        assert_eq!(config.skip_ticks_at_once, 100);
        assert_eq!(config.skip_threshold, 100);
        assert_eq!(config.jump_try_threshold, 5400);
        assert_eq!(config.jump_ignore_threshold, 900);
        assert_eq!(config.polling_interval, Duration::from_secs(10));
    }

    #[test]
    fn clock_rejects_non_positive_fps() {
        let err = ClockConfig::default().with_fps(0.0).validate().unwrap_err();
        assert!(matches!(err, FlowError::InvalidConfig { field: "fps", .. }));
        let err = ClockConfig::default().with_fps(f64::NAN).validate().unwrap_err();
        assert!(matches!(err, FlowError::InvalidConfig { field: "fps", .. }));
    }

    #[test]
    fn clock_rejects_zero_burst() {
        let config = ClockConfig {
            max_frames_per_callback: 0,
            ..ClockConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tick_buffer_rejects_empty_batches() {
        let config = TickBufferConfig {
            fetch_batch_size: 0,
            ..TickBufferConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlowError::InvalidConfig {
                field: "fetch_batch_size",
                ..
            })
        ));
    }

    #[test]
    fn loop_rejects_inconsistent_jump_thresholds() {
        let config = LoopConfig {
            jump_ignore_threshold: 100,
            jump_try_threshold: 50,
            ..LoopConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlowError::InvalidConfig {
                field: "jump_ignore_threshold",
                ..
            })
        ));
    }

    #[test]
    fn loop_rejects_bad_priority_and_rate() {
        let config = LoopConfig {
            default_event_priority: 4,
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LoopConfig {
            playback_rate: 0.0,
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LoopConfig {
            target_age: Some(Age::NULL),
            ..LoopConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlowError::InvalidAge { .. })
        ));
    }
}
