//! Log throttling
//!
//! The broadcast loops run at up to 120 ticks per second; a source that keeps
//! missing or a peer whose transport went away would otherwise flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often a message with the same key is logged
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` (and records the time) if `key` was not logged within the interval
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get_mut(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key`, so the next occurrence is logged immediately
    ///
    /// Call this when the condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled debug logging
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}

/// Throttled warning logging
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert!(throttler.should_log("video-miss"));
        assert!(!throttler.should_log("video-miss"));

        thread::sleep(Duration::from_millis(150));
        assert!(throttler.should_log("video-miss"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("video-miss"));
        assert!(throttler.should_log("audio-miss"));
        assert!(!throttler.should_log("video-miss"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear_on_recovery() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("audio-miss"));
        assert!(!throttler.should_log("audio-miss"));
        throttler.clear("audio-miss");
        assert!(throttler.should_log("audio-miss"));
        throttler.clear("audio-miss");
        assert!(throttler.is_empty());
    }
}
