//! Broadcast manager
//!
//! Owns the registry of peer sessions and at most one broadcast loop per
//! media kind. Each loop pulls one unit per tick from the [`MediaSource`] and
//! hands the same sample to every registered session.
//!
//! ```text
//!              +--------------------+
//!  tick ---->  |    MediaSource     |
//!              +---------+----------+
//!                        | Bytes
//!                        v
//!         registry.read() snapshot (RwLock)
//!          |             |             |
//!      MediaTrack    MediaTrack    MediaTrack     (non-blocking queue)
//!          |             |             |
//!       writer        writer        writer        (one task per track)
//! ```
//!
//! Loops are started on every ICE-connected event and stop by themselves at
//! the first tick that finds the registry empty. The running flags are plain
//! atomics claimed with compare-and-swap, independent of the registry lock.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::session::{ConnectionId, PeerSession, SessionInfo};
use crate::debug_throttled;
use crate::error::{AppError, Result};
use crate::media::{MediaKind, MediaSource};
use crate::utils::{FrameRateCounter, LogThrottler};

/// Frame rate used when the source reports none
const DEFAULT_FPS: u32 = 30;

/// Upper bound on the video tick rate
const MAX_FPS: u32 = 120;

/// Tick period for a frame rate
pub fn frame_period(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.clamp(1, MAX_FPS)
}

/// Per-kind loop flag and counters
struct LoopState {
    kind: MediaKind,
    running: AtomicBool,
    starts: AtomicU64,
    active: AtomicU32,
    ticks: AtomicU64,
    misses: AtomicU64,
}

impl LoopState {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            running: AtomicBool::new(false),
            starts: AtomicU64::new(0),
            active: AtomicU32::new(0),
            ticks: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Set the running flag if it was clear
    fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stats(&self) -> LoopStats {
        LoopStats {
            running: self.is_running(),
            starts: self.starts.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one broadcast loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub running: bool,
    /// Loop tasks spawned since creation
    pub starts: u64,
    /// Loop tasks currently alive
    pub active: u32,
    pub ticks: u64,
    /// Ticks skipped because the source had nothing
    pub misses: u64,
}

/// Snapshot for the status API
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub session_count: usize,
    pub video: LoopStats,
    pub audio: LoopStats,
    /// Frames per second actually fanned out
    pub measured_fps: f32,
}

/// Registry of peer sessions plus the per-kind broadcast loops
pub struct BroadcastManager {
    source: Arc<dyn MediaSource>,
    sessions: RwLock<HashMap<ConnectionId, Arc<PeerSession>>>,
    video: LoopState,
    audio: LoopState,
    audio_frame: Duration,
    frame_rate: FrameRateCounter,
    throttler: LogThrottler,
}

impl BroadcastManager {
    /// `audio_frame` is the fixed Opus frame duration, and the audio tick
    pub fn new(source: Arc<dyn MediaSource>, audio_frame: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            sessions: RwLock::new(HashMap::new()),
            video: LoopState::new(MediaKind::Video),
            audio: LoopState::new(MediaKind::Audio),
            audio_frame,
            frame_rate: FrameRateCounter::new(),
            throttler: LogThrottler::with_secs(10),
        })
    }

    /// Register a negotiated session
    ///
    /// Resolves the video track's playout-delay extension first, then makes
    /// the session a fan-out target of any running loop.
    pub async fn add_session(&self, session: Arc<PeerSession>) -> Result<()> {
        session.video_track().update_extension().await;

        let id = session.id();
        let count = {
            let mut sessions = self.sessions.write();
            if sessions.contains_key(&id) {
                return Err(AppError::BadRequest(format!(
                    "Session {} already registered",
                    id
                )));
            }
            sessions.insert(id, session);
            sessions.len()
        };

        info!("Session {} registered ({} active)", id.short(), count);
        Ok(())
    }

    /// Unregister a session; absent ids are ignored
    ///
    /// Samples already queued on the session's tracks are still sent.
    pub fn remove_session(&self, id: &ConnectionId) -> Option<Arc<PeerSession>> {
        let (removed, count) = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(id);
            (removed, sessions.len())
        };

        if removed.is_some() {
            info!("Session {} removed ({} active)", id.short(), count);
        } else {
            trace!("Session {} already removed", id.short());
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().map(|s| s.info()).collect()
    }

    /// Drop every session; running loops stop at their next tick
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        if !drained.is_empty() {
            info!("Closed {} session(s)", drained.len());
        }
        drained.len()
    }

    pub fn is_running(&self, kind: MediaKind) -> bool {
        self.loop_state(kind).is_running()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            session_count: self.session_count(),
            video: self.video.stats(),
            audio: self.audio.stats(),
            measured_fps: self.frame_rate.fps(),
        }
    }

    /// Ensure the video loop runs
    ///
    /// Returns `true` if this call spawned it.
    pub fn start_video_loop(self: &Arc<Self>) -> bool {
        if !self.video.try_claim() {
            trace!("Video loop already running");
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_video_loop().await });
        true
    }

    /// Ensure the audio loop runs
    ///
    /// Returns `true` if this call spawned it.
    pub fn start_audio_loop(self: &Arc<Self>) -> bool {
        if !self.audio.try_claim() {
            trace!("Audio loop already running");
            return false;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run_audio_loop().await });
        true
    }

    fn loop_state(&self, kind: MediaKind) -> &LoopState {
        match kind {
            MediaKind::Video => &self.video,
            MediaKind::Audio => &self.audio,
        }
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    fn enter_loop(state: &LoopState) {
        state.starts.fetch_add(1, Ordering::Relaxed);
        state.active.fetch_add(1, Ordering::AcqRel);
    }

    fn exit_loop(state: &LoopState) {
        debug!("{} loop stopped", state.kind);
    }

    /// Zero-sessions check done at every tick
    ///
    /// Clears the running flag when the registry is empty. The loop leaves
    /// `active` before releasing the flag, so a loop spawned right after never
    /// overlaps it in the counters. A session that registered between the
    /// count and the clear re-claims the flag here.
    fn should_stop(&self, state: &LoopState) -> bool {
        if self.session_count() > 0 {
            return false;
        }
        state.active.fetch_sub(1, Ordering::AcqRel);
        state.running.store(false, Ordering::Release);
        if self.session_count() > 0 && state.try_claim() {
            state.active.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    async fn run_video_loop(self: Arc<Self>) {
        let state = &self.video;
        Self::enter_loop(state);

        let mut fps = match self.source.current_frame_rate() {
            0 => DEFAULT_FPS,
            fps => fps,
        };
        let mut period = frame_period(fps);
        let mut ticker = Self::ticker(period);
        info!("Video loop started at {} fps", fps);

        loop {
            ticker.tick().await;
            if self.should_stop(state) {
                break;
            }
            state.ticks.fetch_add(1, Ordering::Relaxed);

            let target = self.source.current_frame_rate();
            if target != 0 && target != fps {
                info!("Video frame rate {} -> {}", fps, target);
                fps = target;
                period = frame_period(fps);
                ticker = Self::ticker(period);
            }

            let profile = self.source.video_profile();
            match self
                .source
                .read_video_unit(profile.width, profile.height, profile.bitrate_kbps)
            {
                Ok(data) if !data.is_empty() => {
                    self.fan_out(MediaKind::Video, data, period);
                    self.frame_rate.update();
                }
                Ok(_) => {
                    state.misses.fetch_add(1, Ordering::Relaxed);
                    trace!("No video unit this tick");
                }
                Err(e) => {
                    state.misses.fetch_add(1, Ordering::Relaxed);
                    debug_throttled!(self.throttler, "video_read", "Video read failed: {}", e);
                }
            }
        }

        Self::exit_loop(state);
    }

    async fn run_audio_loop(self: Arc<Self>) {
        let state = &self.audio;
        Self::enter_loop(state);

        let mut ticker = Self::ticker(self.audio_frame);
        info!("Audio loop started, {:?} frames", self.audio_frame);

        loop {
            ticker.tick().await;
            if self.should_stop(state) {
                break;
            }
            state.ticks.fetch_add(1, Ordering::Relaxed);

            match self.source.read_audio_frame() {
                Ok(data) if !data.is_empty() => {
                    self.fan_out(MediaKind::Audio, data, self.audio_frame);
                }
                Ok(_) => {
                    state.misses.fetch_add(1, Ordering::Relaxed);
                    trace!("No audio frame this tick");
                }
                Err(e) => {
                    state.misses.fetch_add(1, Ordering::Relaxed);
                    debug_throttled!(self.throttler, "audio_read", "Audio read failed: {}", e);
                }
            }
        }

        Self::exit_loop(state);
    }

    /// Hand the same payload to every registered session's track of `kind`
    ///
    /// Track writes only enqueue, so the read lock is held for the whole
    /// iteration without waiting on any peer. Cloning `Bytes` shares the
    /// buffer.
    fn fan_out(&self, kind: MediaKind, data: Bytes, duration: Duration) -> usize {
        let sessions = self.sessions.read();
        let mut delivered = 0;
        for session in sessions.values() {
            if let Some(track) = session.track(kind) {
                track.write_data(data.clone(), duration);
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ScriptedSource;
    use crate::webrtc::track::testing::RecordingSink;
    use crate::webrtc::track::MediaTrack;
    use tokio::time::sleep;

    const AUDIO_FRAME: Duration = Duration::from_millis(20);

    fn session(video: Arc<RecordingSink>, audio: Option<Arc<RecordingSink>>) -> Arc<PeerSession> {
        Arc::new(PeerSession::new(
            ConnectionId::new(),
            None,
            MediaTrack::new(MediaKind::Video, video, true),
            audio.map(|sink| MediaTrack::new(MediaKind::Audio, sink, true)),
        ))
    }

    fn setup() -> (Arc<ScriptedSource>, Arc<BroadcastManager>) {
        let source = Arc::new(ScriptedSource::new());
        let manager = BroadcastManager::new(source.clone(), AUDIO_FRAME);
        (source, manager)
    }

    #[test]
    fn test_frame_period() {
        assert_eq!(frame_period(50), Duration::from_millis(20));
        assert_eq!(frame_period(0), Duration::from_secs(1));
        assert_eq!(frame_period(1000), frame_period(MAX_FPS));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_spawn_one_loop() {
        let (_source, manager) = setup();
        manager
            .add_session(session(RecordingSink::new(), None))
            .await
            .unwrap();

        let barrier = Arc::new(tokio::sync::Barrier::new(50));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    manager.start_video_loop()
                })
            })
            .collect();

        let mut spawned = 0;
        for handle in handles {
            if handle.await.unwrap() {
                spawned += 1;
            }
        }
        assert_eq!(spawned, 1);

        sleep(Duration::from_millis(150)).await;
        let stats = manager.stats().video;
        assert_eq!(stats.starts, 1);
        assert_eq!(stats.active, 1);
        assert!(stats.running);
        assert!(!manager.start_video_loop());

        manager.close_all();
        sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_running(MediaKind::Video));
        assert_eq!(manager.stats().video.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_terminates_on_first_tick() {
        let (source, manager) = setup();

        assert!(manager.start_video_loop());
        assert!(manager.is_running(MediaKind::Video));

        sleep(Duration::from_millis(40)).await;
        assert!(!manager.is_running(MediaKind::Video));
        assert_eq!(manager.stats().video.active, 0);
        assert_eq!(source.video_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_last_session_leaves_and_restarts() {
        let (_source, manager) = setup();
        let first = session(RecordingSink::new(), None);
        manager.add_session(first.clone()).await.unwrap();

        assert!(manager.start_video_loop());
        sleep(Duration::from_millis(100)).await;
        assert!(manager.is_running(MediaKind::Video));

        manager.remove_session(&first.id());
        sleep(Duration::from_millis(40)).await;
        assert!(!manager.is_running(MediaKind::Video));

        manager
            .add_session(session(RecordingSink::new(), None))
            .await
            .unwrap();
        assert!(manager.start_video_loop());
        sleep(Duration::from_millis(100)).await;

        let stats = manager.stats().video;
        assert_eq!(stats.starts, 2);
        assert_eq!(stats.active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_session_gets_the_same_samples() {
        let (_source, manager) = setup();
        let sinks: Vec<_> = (0..3).map(|_| RecordingSink::new()).collect();
        for sink in &sinks {
            manager.add_session(session(sink.clone(), None)).await.unwrap();
        }

        manager.start_video_loop();
        sleep(Duration::from_millis(210)).await;

        let expected = sinks[0].payloads();
        assert_eq!(expected.len(), 6);
        assert_eq!(expected[0], ScriptedSource::video_payload(0));
        for sink in &sinks[1..] {
            assert_eq!(sink.payloads(), expected);
        }

        // A late joiner picks up from the next tick
        let late = RecordingSink::new();
        manager.add_session(session(late.clone(), None)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let late_payloads = late.payloads();
        assert!(!late_payloads.is_empty());
        assert_eq!(late_payloads[0], ScriptedSource::video_payload(6));
        assert!(sinks[0].payloads().ends_with(&late_payloads));

        manager.close_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_session_does_not_affect_others() {
        let (_source, manager) = setup();
        let healthy_a = RecordingSink::new();
        let healthy_b = RecordingSink::new();
        let broken = session(RecordingSink::closed(), None);

        manager.add_session(session(healthy_a.clone(), None)).await.unwrap();
        manager.add_session(broken.clone()).await.unwrap();
        manager.add_session(session(healthy_b.clone(), None)).await.unwrap();

        manager.start_video_loop();
        sleep(Duration::from_millis(210)).await;

        assert_eq!(healthy_a.count(), 6);
        assert_eq!(healthy_b.payloads(), healthy_a.payloads());
        assert_eq!(broken.video_track().stats().write_errors, 6);
        assert!(manager.is_running(MediaKind::Video));

        manager.close_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_misses_skip_ticks() {
        let (source, manager) = setup();
        let sink = RecordingSink::new();
        manager.add_session(session(sink.clone(), None)).await.unwrap();

        source.fail_video(true);
        manager.start_video_loop();
        sleep(Duration::from_millis(110)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(manager.stats().video.misses, 3);
        assert!(manager.is_running(MediaKind::Video));

        source.fail_video(false);
        source.starve_video(true);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.count(), 0);

        source.starve_video(false);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.payloads()[0], ScriptedSource::video_payload(0));

        manager.close_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_misses_skip_ticks() {
        let (source, manager) = setup();
        let sink = RecordingSink::new();
        manager
            .add_session(session(RecordingSink::new(), Some(sink.clone())))
            .await
            .unwrap();

        source.fail_audio(true);
        manager.start_audio_loop();
        sleep(Duration::from_millis(110)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(manager.stats().audio.misses, 5);
        assert!(manager.is_running(MediaKind::Audio));

        source.fail_audio(false);
        source.starve_audio(true);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.count(), 0);
        assert_eq!(manager.stats().audio.misses, 10);
        assert!(manager.is_running(MediaKind::Audio));

        source.starve_audio(false);
        sleep(Duration::from_millis(100)).await;
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 5);
        assert_eq!(payloads[0], ScriptedSource::audio_payload(0));
        assert_eq!(manager.stats().audio.starts, 1);

        manager.close_all();
    }

    #[tokio::test]
    async fn test_fan_out_shares_one_payload() {
        let (_source, manager) = setup();
        let with_audio = RecordingSink::new();
        let video_sinks = [RecordingSink::new(), RecordingSink::new()];
        manager
            .add_session(session(video_sinks[0].clone(), Some(with_audio.clone())))
            .await
            .unwrap();
        manager
            .add_session(session(video_sinks[1].clone(), None))
            .await
            .unwrap();

        let payload = Bytes::from_static(b"unit");
        let period = frame_period(30);
        assert_eq!(manager.fan_out(MediaKind::Video, payload.clone(), period), 2);
        assert_eq!(manager.fan_out(MediaKind::Audio, payload.clone(), AUDIO_FRAME), 1);
        tokio::task::yield_now().await;
        sleep(Duration::from_millis(10)).await;

        for sink in &video_sinks {
            let writes = sink.writes();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].data, payload);
            assert_eq!(writes[0].duration, period);
        }
        assert_eq!(with_audio.writes()[0].duration, AUDIO_FRAME);
    }

    #[tokio::test]
    async fn test_stopping_loop_leaves_active_before_releasing_flag() {
        let (_source, manager) = setup();
        let state = &manager.video;
        assert!(state.try_claim());
        BroadcastManager::enter_loop(state);

        assert!(manager.should_stop(state));
        assert_eq!(state.active.load(Ordering::Acquire), 0);
        assert!(!state.is_running());

        // A loop claimed right after starts from a clean count
        assert!(state.try_claim());
        BroadcastManager::enter_loop(state);
        assert_eq!(state.active.load(Ordering::Acquire), 1);

        manager
            .add_session(session(RecordingSink::new(), None))
            .await
            .unwrap();
        assert!(!manager.should_stop(state));
        assert_eq!(state.active.load(Ordering::Acquire), 1);
        assert!(state.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_rate_change_applies_without_restart() {
        let (source, manager) = setup();
        let sink = RecordingSink::new();
        manager.add_session(session(sink.clone(), None)).await.unwrap();

        manager.start_video_loop();
        sleep(Duration::from_millis(1010)).await;
        let at_30 = sink.count();
        assert_eq!(at_30, 30);

        source.set_frame_rate(60);
        for _ in 0..10 {
            sleep(Duration::from_millis(100)).await;
            assert!(manager.is_running(MediaKind::Video));
        }

        let writes = sink.writes();
        let at_60 = writes.len() - at_30;
        assert!((58..=60).contains(&at_60), "{} frames after change", at_60);

        for pair in writes[..at_30].windows(2).skip(1) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= Duration::from_millis(33) && gap <= Duration::from_millis(34));
            assert_eq!(pair[1].duration, frame_period(30));
        }
        for pair in writes[at_30 + 1..].windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= Duration::from_millis(16) && gap <= Duration::from_millis(17));
            assert_eq!(pair[1].duration, frame_period(60));
        }

        assert_eq!(manager.stats().video.starts, 1);
        manager.close_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_audio_broadcast() {
        let (_source, manager) = setup();
        let sinks: Vec<_> = (0..3).map(|_| RecordingSink::new()).collect();
        for sink in &sinks {
            manager
                .add_session(session(RecordingSink::new(), Some(sink.clone())))
                .await
                .unwrap();
        }
        let video_only = RecordingSink::new();
        manager.add_session(session(video_only.clone(), None)).await.unwrap();

        manager.start_audio_loop();
        sleep(Duration::from_millis(1010)).await;

        for sink in &sinks {
            let writes = sink.writes();
            assert_eq!(writes.len(), 50);
            assert!(writes.iter().all(|w| w.duration == AUDIO_FRAME));
            assert!(writes.iter().all(|w| w.playout_delay.is_none()));
        }
        assert_eq!(video_only.count(), 0);
        assert_eq!(manager.stats().audio.ticks, 50);

        manager.close_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_removed_mid_stream() {
        let (_source, manager) = setup();
        let staying = RecordingSink::new();
        let leaving = RecordingSink::new();
        manager
            .add_session(session(RecordingSink::new(), Some(staying.clone())))
            .await
            .unwrap();
        let leaving_session = session(RecordingSink::new(), Some(leaving.clone()));
        manager.add_session(leaving_session.clone()).await.unwrap();

        manager.start_audio_loop();
        sleep(Duration::from_millis(110)).await;
        assert_eq!(leaving.count(), 5);

        assert!(manager.remove_session(&leaving_session.id()).is_some());
        assert!(manager.remove_session(&leaving_session.id()).is_none());
        sleep(Duration::from_millis(100)).await;

        assert_eq!(leaving.count(), 5);
        assert_eq!(staying.count(), 10);
        assert_eq!(manager.session_count(), 1);
        assert!(manager.is_running(MediaKind::Audio));

        manager.close_all();
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected() {
        let (_source, manager) = setup();
        let s = session(RecordingSink::new(), None);
        manager.add_session(s.clone()).await.unwrap();
        assert!(matches!(
            manager.add_session(s).await,
            Err(AppError::BadRequest(_))
        ));
        assert_eq!(manager.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_add_session_resolves_playout_delay() {
        let (_source, manager) = setup();
        let s = session(RecordingSink::with_extension(3), None);
        manager.add_session(s.clone()).await.unwrap();
        assert_eq!(s.video_track().extension_id(), Some(3));
    }
}
