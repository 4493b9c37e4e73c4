//! Frame pacing.
//!
//! The [`Clock`] converts irregular wall-clock callback deltas into a fixed-rate sequence of
//! frame notifications, and tells the callback source how long to wait before calling again.

use crate::config::ClockConfig;
use crate::signal::Signal;

/// Accumulated time above `wait_time * ANTICIPATE_RATE` already counts as one frame.
const ANTICIPATE_RATE: f64 = 0.8;

/// Payload of a single frame notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameArgs {
    /// Duration of one frame in milliseconds at the current scale.
    pub delta_time: f64,
    /// Set by the frame handler to stop the remaining notifications of this callback.
    pub interrupt: bool,
}

/// Converts callback deltas into frame notifications.
///
/// # Example
///
/// ```
/// use lockstep_flow::{Clock, ClockConfig};
///
/// let mut clock = Clock::new(ClockConfig::default().with_fps(50.0));
/// clock.start();
///
/// let mut frames = 0;
/// let wait = clock.on_looper_call(21.0, |_| frames += 1);
/// assert_eq!(frames, 1);
/// assert_eq!(wait, 19.0);
/// ```
#[derive(Debug)]
pub struct Clock {
    fps: f64,
    scale_factor: f64,
    max_frames_per_callback: u32,
    delta_time_broken_threshold: f64,
    wait_time: f64,
    skip_frame_wait_time: f64,
    real_max_frames_per_callback: u32,
    total_delta_time: f64,
    running: bool,
    raw_frame: Signal<()>,
}

impl Clock {
    /// Creates a stopped clock.
    #[must_use]
    pub fn new(config: ClockConfig) -> Self {
        let mut clock = Self {
            fps: config.fps,
            scale_factor: config.scale_factor,
            max_frames_per_callback: config.max_frames_per_callback,
            delta_time_broken_threshold: config.delta_time_broken_threshold_ms,
            wait_time: 0.0,
            skip_frame_wait_time: 0.0,
            real_max_frames_per_callback: 1,
            total_delta_time: 0.0,
            running: false,
            raw_frame: Signal::new(),
        };
        clock.update_wait_time();
        clock
    }

    /// Starts accepting callbacks and resets the sub-frame accumulator.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.total_delta_time = 0.0;
        self.running = true;
        tracing::debug!(fps = self.fps, scale_factor = self.scale_factor, "clock started");
    }

    /// Stops accepting callbacks.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        tracing::debug!("clock stopped");
    }

    /// Whether the clock is started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Nominal frames per second, unaffected by the scale factor.
    #[must_use]
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Current scale factor.
    #[must_use]
    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Milliseconds per frame at the current scale.
    #[must_use]
    pub fn wait_time(&self) -> f64 {
        self.wait_time
    }

    /// Changes the effective frame rate multiplier. Resets the sub-frame accumulator.
    pub fn change_scale_factor(&mut self, scale_factor: f64) {
        self.scale_factor = scale_factor;
        self.update_wait_time();
        self.total_delta_time = 0.0;
    }

    /// Signal fired once per external callback, after the frame notifications.
    pub fn raw_frame_mut(&mut self) -> &mut Signal<()> {
        &mut self.raw_frame
    }

    /// Processes one external callback.
    ///
    /// Calls `on_frame` once per due frame (at most the scaled per-callback cap), stopping early
    /// if a handler sets [`FrameArgs::interrupt`]. Returns the number of milliseconds until the
    /// next callback is wanted; a negative value asks for an immediate callback.
    pub fn on_looper_call(
        &mut self,
        delta_time: f64,
        mut on_frame: impl FnMut(&mut FrameArgs),
    ) -> f64 {
        if !self.running {
            return self.wait_time;
        }

        let delta_time = if delta_time.is_nan() || delta_time > self.delta_time_broken_threshold {
            self.wait_time
        } else if delta_time <= 0.0 {
            return self.wait_time - self.total_delta_time;
        } else {
            delta_time
        };

        let total_delta_time = self.total_delta_time + delta_time;
        if total_delta_time <= self.skip_frame_wait_time {
            self.total_delta_time = total_delta_time;
            return self.wait_time - total_delta_time;
        }

        let mut frame_count = if total_delta_time < self.wait_time {
            1
        } else {
            (total_delta_time / self.wait_time).floor() as u32
        };
        if frame_count > self.real_max_frames_per_callback {
            frame_count = self.real_max_frames_per_callback;
        }

        let mut args = FrameArgs {
            delta_time: self.wait_time,
            interrupt: false,
        };
        for _ in 0..frame_count {
            on_frame(&mut args);
            if args.interrupt {
                break;
            }
        }

        self.total_delta_time = total_delta_time - f64::from(frame_count) * self.wait_time;
        self.raw_frame.fire(&());
        self.wait_time - self.total_delta_time
    }

    fn update_wait_time(&mut self) {
        self.wait_time = 1000.0 / (self.fps * self.scale_factor);
        self.skip_frame_wait_time = (self.wait_time * ANTICIPATE_RATE).floor();
        self.real_max_frames_per_callback =
            ((f64::from(self.max_frames_per_callback) * self.scale_factor).floor() as u32).max(1);
    }
}
