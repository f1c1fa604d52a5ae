//! Scripted media source
//!
//! Deterministic stand-in for the capture pipeline. Payloads are numbered
//! (`video-0`, `video-1`, ...) so fan-out tests can compare what each peer
//! received.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::{MediaSource, VideoProfile};
use crate::error::{AppError, Result};

/// In-memory [`MediaSource`] with adjustable behaviour
pub struct ScriptedSource {
    profile: Mutex<VideoProfile>,
    video_reads: AtomicU64,
    audio_reads: AtomicU64,
    video_produced: AtomicU64,
    audio_produced: AtomicU64,
    fail_video: AtomicBool,
    fail_audio: AtomicBool,
    empty_video: AtomicBool,
    empty_audio: AtomicBool,
    last_request: Mutex<Option<(u32, u32, u32)>>,
    frame_rate_override: AtomicU32,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::with_profile(VideoProfile::default())
    }

    pub fn with_profile(profile: VideoProfile) -> Self {
        Self {
            profile: Mutex::new(profile),
            video_reads: AtomicU64::new(0),
            audio_reads: AtomicU64::new(0),
            video_produced: AtomicU64::new(0),
            audio_produced: AtomicU64::new(0),
            fail_video: AtomicBool::new(false),
            fail_audio: AtomicBool::new(false),
            empty_video: AtomicBool::new(false),
            empty_audio: AtomicBool::new(false),
            last_request: Mutex::new(None),
            frame_rate_override: AtomicU32::new(0),
        }
    }

    /// Change the target frame rate seen by a running video loop
    pub fn set_frame_rate(&self, fps: u32) {
        self.profile.lock().fps = fps;
    }

    /// Report `fps` from `current_frame_rate` while leaving the profile alone
    ///
    /// Zero restores the profile value.
    pub fn override_frame_rate(&self, fps: u32) {
        self.frame_rate_override.store(fps, Ordering::SeqCst);
    }

    /// Make video reads return an error
    pub fn fail_video(&self, fail: bool) {
        self.fail_video.store(fail, Ordering::SeqCst);
    }

    /// Make audio reads return an error
    pub fn fail_audio(&self, fail: bool) {
        self.fail_audio.store(fail, Ordering::SeqCst);
    }

    /// Make video reads return an empty buffer
    pub fn starve_video(&self, empty: bool) {
        self.empty_video.store(empty, Ordering::SeqCst);
    }

    /// Make audio reads return an empty buffer
    pub fn starve_audio(&self, empty: bool) {
        self.empty_audio.store(empty, Ordering::SeqCst);
    }

    /// Number of `read_video_unit` calls, misses included
    pub fn video_reads(&self) -> u64 {
        self.video_reads.load(Ordering::SeqCst)
    }

    /// Number of `read_audio_frame` calls, misses included
    pub fn audio_reads(&self) -> u64 {
        self.audio_reads.load(Ordering::SeqCst)
    }

    /// `(width, height, bitrate_kbps)` of the latest video read
    pub fn last_video_request(&self) -> Option<(u32, u32, u32)> {
        *self.last_request.lock()
    }

    /// Payload of the `n`-th produced video unit
    pub fn video_payload(n: u64) -> Bytes {
        Bytes::from(format!("video-{}", n))
    }

    /// Payload of the `n`-th produced audio frame
    pub fn audio_payload(n: u64) -> Bytes {
        Bytes::from(format!("audio-{}", n))
    }
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSource for ScriptedSource {
    fn read_video_unit(&self, width: u32, height: u32, bitrate_kbps: u32) -> Result<Bytes> {
        self.video_reads.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some((width, height, bitrate_kbps));

        if self.fail_video.load(Ordering::SeqCst) {
            return Err(AppError::MediaSource("scripted video failure".to_string()));
        }
        if self.empty_video.load(Ordering::SeqCst) {
            return Ok(Bytes::new());
        }
        let n = self.video_produced.fetch_add(1, Ordering::SeqCst);
        Ok(Self::video_payload(n))
    }

    fn read_audio_frame(&self) -> Result<Bytes> {
        self.audio_reads.fetch_add(1, Ordering::SeqCst);

        if self.fail_audio.load(Ordering::SeqCst) {
            return Err(AppError::MediaSource("scripted audio failure".to_string()));
        }
        if self.empty_audio.load(Ordering::SeqCst) {
            return Ok(Bytes::new());
        }
        let n = self.audio_produced.fetch_add(1, Ordering::SeqCst);
        Ok(Self::audio_payload(n))
    }

    fn video_profile(&self) -> VideoProfile {
        *self.profile.lock()
    }

    fn current_frame_rate(&self) -> u32 {
        match self.frame_rate_override.load(Ordering::SeqCst) {
            0 => self.video_profile().fps,
            fps => fps,
        }
    }
}
