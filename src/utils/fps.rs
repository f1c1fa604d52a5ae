//! Delivered frame rate measurement

use parking_lot::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct CounterState {
    window_start: Instant,
    frames_in_window: u32,
    last_fps: f32,
}

/// Counts frames delivered by the video loop and reports frames per second
/// over the last completed one-second window.
pub struct FrameRateCounter {
    state: Mutex<CounterState>,
}

impl FrameRateCounter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState {
                window_start: Instant::now(),
                frames_in_window: 0,
                last_fps: 0.0,
            }),
        }
    }

    /// Record one delivered frame
    pub fn update(&self) {
        self.update_at(Instant::now());
    }

    fn update_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.frames_in_window += 1;
        Self::roll(&mut state, now);
    }

    /// Frames per second of the last completed window
    ///
    /// Drops to zero once a full window passes without frames.
    pub fn fps(&self) -> f32 {
        self.fps_at(Instant::now())
    }

    fn fps_at(&self, now: Instant) -> f32 {
        let mut state = self.state.lock();
        Self::roll(&mut state, now);
        state.last_fps
    }

    fn roll(state: &mut CounterState, now: Instant) {
        let elapsed = now.duration_since(state.window_start);
        if elapsed < WINDOW {
            return;
        }
        state.last_fps = if elapsed >= WINDOW * 2 {
            0.0
        } else {
            state.frames_in_window as f32 / elapsed.as_secs_f32()
        };
        state.frames_in_window = 0;
        state.window_start = now;
    }
}

impl Default for FrameRateCounter {
    fn default() -> Self {
        Self::new()
    }
}
