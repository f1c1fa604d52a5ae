//! Utility modules
//!
//! Common helpers shared by the broadcast loops and the web layer.

pub mod fps;
pub mod throttle;

pub use fps::FrameRateCounter;
pub use throttle::LogThrottler;
