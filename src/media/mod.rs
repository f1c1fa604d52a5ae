//! Media sources for the broadcast loops
//!
//! The broadcast core never talks to capture hardware directly. It pulls from
//! a [`MediaSource`]: one encoded video access unit or one Opus frame per
//! tick. Two implementations exist:
//!
//! - [`PipeSource`] reads the byte streams produced by the appliance's
//!   encoder daemon (H.264 Annex-B and Ogg/Opus, via FIFO or file)
//! - [`ScriptedSource`] is a deterministic in-memory double for tests
//!
//! ```text
//! encoder daemon --FIFO--> reader thread --queue--> read_video_unit()
//!                                                         |
//!                                                 BroadcastManager tick
//! ```

pub mod h264;
pub mod mock;
pub mod ogg;
pub mod pipe;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use mock::ScriptedSource;
pub use pipe::PipeSource;

/// Media kind carried by a track or a broadcast loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// Encoder parameters for the video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub fps: u32,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            bitrate_kbps: 4000,
            fps: 30,
        }
    }
}

/// Producer of encoded media for the broadcast loops
///
/// Reads must not block for longer than a fraction of a tick. An `Err` or an
/// empty buffer is a transient miss: the loop skips that tick and carries on.
pub trait MediaSource: Send + Sync {
    /// One encoded H.264 access unit (Annex-B)
    fn read_video_unit(&self, width: u32, height: u32, bitrate_kbps: u32) -> Result<Bytes>;

    /// One fixed-duration Opus frame
    fn read_audio_frame(&self) -> Result<Bytes>;

    /// Current encoder parameters, re-read on every video tick
    fn video_profile(&self) -> VideoProfile;

    /// Target frame rate; 0 means "keep the current cadence"
    fn current_frame_rate(&self) -> u32 {
        self.video_profile().fps
    }
}
