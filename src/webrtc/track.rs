//! Outbound media tracks
//!
//! A [`MediaTrack`] is the write side of one RTP sender on one peer
//! connection. Codec parameters and extension policy are fixed when the track
//! is built. Samples are handed to a per-track writer task through a short
//! queue, so a peer whose transport stalls never holds up a broadcast tick.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::util::marshal::{Marshal, MarshalSize};

use crate::error::{AppError, Result};
use crate::media::MediaKind;

/// Playout-delay RTP header extension
pub const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

/// Samples buffered per track before new ones are dropped
const TRACK_QUEUE_DEPTH: usize = 8;

/// Codec parameters of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecDescriptor {
    pub mime_type: &'static str,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: &'static str,
}

impl CodecDescriptor {
    /// H.264 constrained baseline, one access unit per sample
    pub const H264: Self = Self {
        mime_type: "video/H264",
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
    };

    /// Opus, 48 kHz stereo
    pub const OPUS: Self = Self {
        mime_type: "audio/opus",
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1",
    };

    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Video => Self::H264,
            MediaKind::Audio => Self::OPUS,
        }
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.mime_type.to_string(),
            clock_rate: self.clock_rate,
            channels: self.channels,
            sdp_fmtp_line: self.sdp_fmtp_line.to_string(),
            rtcp_feedback: vec![],
        }
    }
}

/// Header extensions a track attaches to its packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPolicy {
    None,
    /// Zero playout delay, once the receiver negotiated the extension
    PlayoutDelay,
}

/// Playout-delay extension payload
///
/// Two 12-bit values in 10 ms units: minimum then maximum delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayoutDelayExtension {
    pub min_delay: u16,
    pub max_delay: u16,
}

impl PlayoutDelayExtension {
    const SIZE: usize = 3;
    const MAX_VALUE: u16 = 0x0FFF;

    /// Render frames as soon as they are decodable
    pub fn zero() -> Self {
        Self::default()
    }
}

impl MarshalSize for PlayoutDelayExtension {
    fn marshal_size(&self) -> usize {
        Self::SIZE
    }
}

impl Marshal for PlayoutDelayExtension {
    fn marshal_to(&self, buf: &mut [u8]) -> std::result::Result<usize, webrtc::util::Error> {
        if buf.len() < Self::SIZE {
            return Err(webrtc::util::Error::Other(
                "buffer too small for playout delay".to_string(),
            ));
        }
        let min = self.min_delay.min(Self::MAX_VALUE);
        let max = self.max_delay.min(Self::MAX_VALUE);
        buf[0] = (min >> 4) as u8;
        buf[1] = (((min & 0x0F) << 4) | (max >> 8)) as u8;
        buf[2] = (max & 0xFF) as u8;
        Ok(Self::SIZE)
    }
}

/// Write side of an RTP sender
///
/// Implemented over webrtc-rs by [`RtcSampleSink`]; tests substitute
/// recording or failing sinks.
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Packetize and send one sample
    async fn write_sample(
        &self,
        sample: &Sample,
        playout_delay: Option<PlayoutDelayExtension>,
    ) -> Result<()>;

    /// Header extension id negotiated for `uri`, if any
    async fn extension_id(&self, uri: &str) -> Option<u8>;
}

/// [`SampleSink`] over a webrtc-rs sample track and its sender
pub struct RtcSampleSink {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

impl RtcSampleSink {
    pub fn new(track: Arc<TrackLocalStaticSample>, sender: Arc<RTCRtpSender>) -> Self {
        Self { track, sender }
    }

    /// Build the webrtc-rs track for `kind`
    pub fn local_track(kind: MediaKind, stream_id: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            CodecDescriptor::for_kind(kind).capability(),
            kind.to_string(),
            stream_id.to_string(),
        ))
    }
}

#[async_trait]
impl SampleSink for RtcSampleSink {
    async fn write_sample(
        &self,
        sample: &Sample,
        playout_delay: Option<PlayoutDelayExtension>,
    ) -> Result<()> {
        let result = match playout_delay {
            Some(ext) => {
                let extensions = [rtp::extension::HeaderExtension::Custom {
                    uri: PLAYOUT_DELAY_URI.into(),
                    extension: Box::new(ext),
                }];
                self.track
                    .write_sample_with_extensions(sample, &extensions)
                    .await
            }
            None => self.track.write_sample(sample).await,
        };
        result.map_err(|e| match e {
            webrtc::Error::ErrConnectionClosed => AppError::TrackClosed(e.to_string()),
            other => AppError::WebRtcError(other.to_string()),
        })
    }

    async fn extension_id(&self, uri: &str) -> Option<u8> {
        let params = self.sender.get_parameters().await;
        params
            .rtp_parameters
            .header_extensions
            .iter()
            .find(|ext| ext.uri == uri)
            .and_then(|ext| u8::try_from(ext.id).ok())
    }
}

/// Per-track delivery counters
#[derive(Debug, Default)]
pub struct TrackStats {
    samples_written: AtomicU64,
    bytes_written: AtomicU64,
    write_errors: AtomicU64,
    samples_dropped: AtomicU64,
}

/// Point-in-time copy of [`TrackStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackStatsSnapshot {
    pub samples_written: u64,
    pub bytes_written: u64,
    pub write_errors: u64,
    pub samples_dropped: u64,
}

impl TrackStats {
    pub fn snapshot(&self) -> TrackStatsSnapshot {
        TrackStatsSnapshot {
            samples_written: self.samples_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
        }
    }
}

struct TrackShared {
    label: String,
    sink: Arc<dyn SampleSink>,
    stats: TrackStats,
    /// 0 while the extension is not negotiated
    extension_id: AtomicU8,
}

/// One outbound media track of a peer
pub struct MediaTrack {
    kind: MediaKind,
    codec: CodecDescriptor,
    policy: ExtensionPolicy,
    shared: Arc<TrackShared>,
    queue: mpsc::Sender<Sample>,
}

impl MediaTrack {
    /// Create a track and spawn its writer task
    ///
    /// Must be called from within a Tokio runtime. The writer task ends when
    /// the track is dropped.
    pub fn new(kind: MediaKind, sink: Arc<dyn SampleSink>, playout_delay: bool) -> Self {
        let policy = match kind {
            MediaKind::Video if playout_delay => ExtensionPolicy::PlayoutDelay,
            _ => ExtensionPolicy::None,
        };
        let shared = Arc::new(TrackShared {
            label: kind.to_string(),
            sink,
            stats: TrackStats::default(),
            extension_id: AtomicU8::new(0),
        });

        let (queue, rx) = mpsc::channel(TRACK_QUEUE_DEPTH);
        tokio::spawn(Self::run_writer(shared.clone(), policy, rx));

        Self {
            kind,
            codec: CodecDescriptor::for_kind(kind),
            policy,
            shared,
            queue,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn codec(&self) -> &CodecDescriptor {
        &self.codec
    }

    pub fn extension_policy(&self) -> ExtensionPolicy {
        self.policy
    }

    /// Negotiated playout-delay extension id, if any
    pub fn extension_id(&self) -> Option<u8> {
        match self.shared.extension_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Resolve the negotiated playout-delay extension
    ///
    /// Called once when the session is registered. Audio tracks carry no
    /// extension and return immediately.
    pub async fn update_extension(&self) {
        if self.policy != ExtensionPolicy::PlayoutDelay {
            return;
        }
        match self.shared.sink.extension_id(PLAYOUT_DELAY_URI).await {
            Some(id) => {
                debug!("Playout delay extension negotiated with id {}", id);
                self.shared.extension_id.store(id, Ordering::Release);
            }
            None => debug!("Playout delay extension not negotiated"),
        }
    }

    /// Queue one sample for sending
    ///
    /// Never waits: a full queue drops the sample and a closed track ignores
    /// it. Both are counted, neither is reported to the caller.
    pub fn write(&self, sample: Sample) {
        match self.queue.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.shared.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
                if dropped % 100 == 0 {
                    debug!(
                        "{} track queue full, {} sample(s) dropped",
                        self.shared.label,
                        dropped + 1
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Convenience over [`write`](Self::write)
    pub fn write_data(&self, data: Bytes, duration: Duration) {
        self.write(Sample {
            data,
            duration,
            ..Default::default()
        });
    }

    pub fn stats(&self) -> TrackStatsSnapshot {
        self.shared.stats.snapshot()
    }

    async fn run_writer(
        shared: Arc<TrackShared>,
        policy: ExtensionPolicy,
        mut rx: mpsc::Receiver<Sample>,
    ) {
        while let Some(sample) = rx.recv().await {
            let playout_delay = match policy {
                ExtensionPolicy::PlayoutDelay
                    if shared.extension_id.load(Ordering::Acquire) != 0 =>
                {
                    Some(PlayoutDelayExtension::zero())
                }
                _ => None,
            };

            let len = sample.data.len() as u64;
            match shared.sink.write_sample(&sample, playout_delay).await {
                Ok(()) => {
                    shared.stats.samples_written.fetch_add(1, Ordering::Relaxed);
                    shared.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
                }
                Err(e) => {
                    // Session removal is the teardown path; writes only count
                    let errors = shared.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    if errors % 100 == 0 {
                        debug!("{} write failed ({} total): {}", shared.label, errors + 1, e);
                    }
                }
            }
        }
        trace!("{} track writer finished", shared.label);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_playout_delay_encoding() {
        let mut buf = [0xFFu8; 3];
        let n = PlayoutDelayExtension::zero().marshal_to(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, [0, 0, 0]);

        // 100 ms min (10 units), 1 s max (100 units)
        let ext = PlayoutDelayExtension {
            min_delay: 10,
            max_delay: 100,
        };
        ext.marshal_to(&mut buf).unwrap();
        assert_eq!(buf, [0x00, 0xA0, 0x64]);
        assert_eq!(ext.marshal_size(), 3);

        assert!(ext.marshal_to(&mut [0u8; 2]).is_err());
    }

    #[test]
    fn test_codec_descriptors() {
        let video = CodecDescriptor::for_kind(MediaKind::Video).capability();
        assert_eq!(video.mime_type, "video/H264");
        assert_eq!(video.clock_rate, 90000);

        let audio = CodecDescriptor::for_kind(MediaKind::Audio);
        assert_eq!(audio.clock_rate, 48000);
        assert_eq!(audio.channels, 2);
    }

    #[tokio::test]
    async fn test_video_track_carries_playout_delay_once_negotiated() {
        let sink = RecordingSink::with_extension(5);
        let track = MediaTrack::new(MediaKind::Video, sink.clone(), true);
        assert_eq!(track.extension_policy(), ExtensionPolicy::PlayoutDelay);

        track.write_data(Bytes::from_static(b"before"), Duration::from_millis(33));
        settle().await;
        track.update_extension().await;
        assert_eq!(track.extension_id(), Some(5));
        track.write_data(Bytes::from_static(b"after"), Duration::from_millis(33));
        settle().await;

        let writes = sink.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].playout_delay, None);
        assert_eq!(writes[1].playout_delay, Some(PlayoutDelayExtension::zero()));
    }

    #[tokio::test]
    async fn test_audio_track_has_no_extension() {
        let sink = RecordingSink::with_extension(5);
        let track = MediaTrack::new(MediaKind::Audio, sink.clone(), true);
        assert_eq!(track.extension_policy(), ExtensionPolicy::None);

        track.update_extension().await;
        assert_eq!(track.extension_id(), None);

        track.write_data(Bytes::from_static(b"opus"), Duration::from_millis(20));
        settle().await;
        assert_eq!(sink.writes()[0].playout_delay, None);
        assert_eq!(sink.writes()[0].duration, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_closed_sink_errors_are_swallowed() {
        let sink = RecordingSink::closed();
        let track = MediaTrack::new(MediaKind::Video, sink, false);

        for _ in 0..3 {
            track.write_data(Bytes::from_static(b"x"), Duration::from_millis(33));
            settle().await;
        }

        let stats = track.stats();
        assert_eq!(stats.samples_written, 0);
        assert_eq!(stats.write_errors, 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_samples() {
        let sink = RecordingSink::new();
        let track = MediaTrack::new(MediaKind::Video, sink.clone(), false);

        // No yield in between: the writer task cannot drain
        for _ in 0..TRACK_QUEUE_DEPTH + 3 {
            track.write_data(Bytes::from_static(b"x"), Duration::from_millis(33));
        }
        settle().await;

        let stats = track.stats();
        assert_eq!(stats.samples_dropped, 3);
        assert_eq!(stats.samples_written, TRACK_QUEUE_DEPTH as u64);
        assert_eq!(sink.count(), TRACK_QUEUE_DEPTH);
    }
}
