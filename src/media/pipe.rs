//! Hardware-backed media source
//!
//! The appliance's capture/encode daemon writes an H.264 Annex-B elementary
//! stream and an Ogg/Opus stream into named pipes. One reader thread per kind
//! cuts the stream into units (access units, Opus packets) and parks them in a short queue; the broadcast
//! loops pop from that queue without blocking.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, info, trace, warn};

use super::h264::{is_keyframe, AccessUnitSplitter};
use super::ogg::OggPacketReader;
use super::{MediaSource, VideoProfile};
use crate::config::{ConfigStore, SourceConfig};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Delay before reopening a pipe after its writer went away
const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// Read chunk size for the video stream
const READ_CHUNK: usize = 64 * 1024;

/// Opus identification header packet
const OPUS_HEAD: &[u8] = b"OpusHead";

/// Opus comment header packet
const OPUS_TAGS: &[u8] = b"OpusTags";

/// How a reader thread hands units to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Regular file: wait for room so playback follows the consumer's cadence
    Paced,
    /// Live pipe: never stall the encoder, drop the unit instead
    Live,
}

/// Media source fed by the encoder daemon's pipes
pub struct PipeSource {
    config: ConfigStore,
    video_rx: Option<Mutex<mpsc::Receiver<Bytes>>>,
    audio_rx: Option<Mutex<mpsc::Receiver<Bytes>>>,
}

impl PipeSource {
    /// Spawn the reader threads for the configured paths
    ///
    /// A kind without a configured path never produces data; every read is a
    /// transient miss.
    pub fn new(config: ConfigStore) -> Result<Self> {
        let source = config.get().source.clone();
        let depth = source.queue_depth.max(1);

        let video_rx = match &source.video_path {
            Some(path) => {
                let (tx, rx) = mpsc::channel(depth);
                spawn_reader("video-reader", PathBuf::from(path), &source, tx, pump_h264)?;
                info!("Video source: {}", path);
                Some(Mutex::new(rx))
            }
            None => {
                warn!("No video source path configured, video loop will idle");
                None
            }
        };

        let audio_rx = match &source.audio_path {
            Some(path) => {
                let (tx, rx) = mpsc::channel(depth);
                spawn_reader("audio-reader", PathBuf::from(path), &source, tx, pump_ogg_opus)?;
                info!("Audio source: {}", path);
                Some(Mutex::new(rx))
            }
            None => {
                debug!("No audio source path configured");
                None
            }
        };

        Ok(Self {
            config,
            video_rx,
            audio_rx,
        })
    }

    fn pop(rx: &Option<Mutex<mpsc::Receiver<Bytes>>>, kind: &str) -> Result<Bytes> {
        let Some(rx) = rx else {
            return Ok(Bytes::new());
        };
        match rx.lock().try_recv() {
            Ok(unit) => Ok(unit),
            Err(TryRecvError::Empty) => Ok(Bytes::new()),
            Err(TryRecvError::Disconnected) => Err(AppError::MediaSource(format!(
                "{} reader stopped",
                kind
            ))),
        }
    }
}

impl MediaSource for PipeSource {
    /// The encoder behind the pipe is configured out of band; the requested
    /// geometry is only traced.
    fn read_video_unit(&self, width: u32, height: u32, bitrate_kbps: u32) -> Result<Bytes> {
        trace!("Video read {}x{} @ {} kbps", width, height, bitrate_kbps);
        Self::pop(&self.video_rx, "video")
    }

    fn read_audio_frame(&self) -> Result<Bytes> {
        Self::pop(&self.audio_rx, "audio")
    }

    fn video_profile(&self) -> VideoProfile {
        let video = &self.config.get().video;
        VideoProfile {
            width: video.width,
            height: video.height,
            bitrate_kbps: video.bitrate_kbps,
            fps: video.fps,
        }
    }
}

/// Reads one opened stream to its end; returns `false` once the consumer is gone
type Pump = fn(File, &mpsc::Sender<Bytes>, Delivery) -> bool;

fn spawn_reader(
    name: &str,
    path: PathBuf,
    source: &SourceConfig,
    tx: mpsc::Sender<Bytes>,
    pump: Pump,
) -> Result<()> {
    let loop_playback = source.loop_playback;
    let thread_name = name.to_string();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || run_reader(&thread_name, &path, loop_playback, tx, pump))?;
    Ok(())
}

fn run_reader(
    name: &str,
    path: &Path,
    loop_playback: bool,
    tx: mpsc::Sender<Bytes>,
    pump: Pump,
) {
    let throttler = LogThrottler::with_secs(30);

    loop {
        if tx.is_closed() {
            break;
        }

        match File::open(path) {
            Ok(file) => {
                throttler.clear("open");
                let is_file = file.metadata().map(|m| m.is_file()).unwrap_or(false);
                let delivery = if is_file {
                    Delivery::Paced
                } else {
                    Delivery::Live
                };
                debug!("{} opened {} ({:?})", name, path.display(), delivery);

                if !pump(file, &tx, delivery) {
                    break;
                }
                if is_file && !loop_playback {
                    info!("{} reached end of {}", name, path.display());
                    break;
                }
            }
            Err(e) => {
                warn_throttled!(throttler, "open", "{} cannot open {}: {}", name, path.display(), e);
            }
        }

        std::thread::sleep(REOPEN_DELAY);
    }

    debug!("{} exiting", name);
}

fn deliver(tx: &mpsc::Sender<Bytes>, unit: Bytes, delivery: Delivery) -> bool {
    match delivery {
        Delivery::Paced => tx.blocking_send(unit).is_ok(),
        Delivery::Live => match tx.try_send(unit) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Source queue full, dropping unit");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        },
    }
}

fn pump_h264(mut file: File, tx: &mpsc::Sender<Bytes>, delivery: Delivery) -> bool {
    let mut splitter = AccessUnitSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    // Units before the first IDR cannot be decoded by a joining peer
    let mut synced = false;
    let mut skipped = 0u64;

    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for unit in splitter.push(&chunk[..n]) {
                    if !synced {
                        if !is_keyframe(&unit) {
                            skipped += 1;
                            continue;
                        }
                        synced = true;
                        if skipped > 0 {
                            debug!("Skipped {} unit(s) before the first keyframe", skipped);
                        }
                    }
                    if !deliver(tx, unit, delivery) {
                        return false;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Video stream read error: {}", e);
                break;
            }
        }
    }

    for unit in splitter.flush() {
        if !synced && !is_keyframe(&unit) {
            continue;
        }
        synced = true;
        if !deliver(tx, unit, delivery) {
            return false;
        }
    }
    true
}

fn pump_ogg_opus(file: File, tx: &mpsc::Sender<Bytes>, delivery: Delivery) -> bool {
    let mut packets = OggPacketReader::new(BufReader::new(file));

    loop {
        match packets.next_packet() {
            Ok(Some(packet)) => {
                if packet.starts_with(OPUS_HEAD) {
                    log_opus_head(&packet);
                    continue;
                }
                if packet.is_empty() || packet.starts_with(OPUS_TAGS) {
                    continue;
                }
                if !deliver(tx, packet, delivery) {
                    return false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Audio stream read error: {}", e);
                break;
            }
        }
    }
    true
}

fn log_opus_head(packet: &[u8]) {
    if packet.len() >= 16 {
        let channels = packet[9];
        let sample_rate = u32::from_le_bytes([packet[12], packet[13], packet[14], packet[15]]);
        debug!("Opus stream: {} Hz, {} channel(s)", sample_rate, channels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ogg::testing::packets_page;
    use std::io::Write;
    use tempfile::tempdir;

    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f];
    const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const P1: &[u8] = &[0, 0, 0, 1, 0x41, 0x9a, 0x02, 0x03];

    #[tokio::test]
    async fn test_missing_paths_are_misses() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(&dir.path().join("cfg.db")).await.unwrap();
        let source = PipeSource::new(store).unwrap();

        assert!(source.read_video_unit(1920, 1080, 4000).unwrap().is_empty());
        assert!(source.read_audio_frame().unwrap().is_empty());
        assert_eq!(source.current_frame_rate(), 30);
    }

    #[tokio::test]
    async fn test_reads_access_units_from_first_keyframe() {
        let dir = tempdir().unwrap();
        let video_path = dir.path().join("stream.h264");
        let mut file = File::create(&video_path).unwrap();
        for part in [P1, P1, SPS, IDR, P1, P1] {
            file.write_all(part).unwrap();
        }
        drop(file);

        let store = ConfigStore::new(&dir.path().join("cfg.db")).await.unwrap();
        store
            .update(|c| {
                c.source.video_path = Some(video_path.to_string_lossy().to_string());
                c.video.fps = 25;
            })
            .await
            .unwrap();
        let source = PipeSource::new(store).unwrap();
        assert_eq!(source.video_profile().fps, 25);

        let mut units = Vec::new();
        for _ in 0..100 {
            match source.read_video_unit(1920, 1080, 4000) {
                Ok(unit) if !unit.is_empty() => units.push(unit),
                Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(_) => break,
            }
            if units.len() == 3 {
                break;
            }
        }

        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &[SPS, IDR].concat()[..]);
        assert_eq!(&units[1][..], P1);
        assert_eq!(&units[2][..], P1);
    }

    #[tokio::test]
    async fn test_audio_pages_are_split_into_packets() {
        let dir = tempdir().unwrap();
        let audio_path = dir.path().join("stream.opus");
        let mut head = b"OpusHead".to_vec();
        head.extend_from_slice(&[1, 2, 0x38, 0x01, 0x80, 0xbb, 0, 0, 0, 0, 0]);
        let mut file = File::create(&audio_path).unwrap();
        file.write_all(&packets_page(0, &[&head[..]])).unwrap();
        file.write_all(&packets_page(1, &[&b"OpusTags\0\0\0\0"[..]])).unwrap();
        file.write_all(&packets_page(2, &[&b"PKT-A"[..], &b"PKT-B"[..], &b"PKT-C"[..]]))
            .unwrap();
        drop(file);

        let store = ConfigStore::new(&dir.path().join("cfg.db")).await.unwrap();
        store
            .update(|c| c.source.audio_path = Some(audio_path.to_string_lossy().to_string()))
            .await
            .unwrap();
        let source = PipeSource::new(store).unwrap();

        let mut frames = Vec::new();
        for _ in 0..100 {
            match source.read_audio_frame() {
                Ok(frame) if !frame.is_empty() => frames.push(frame),
                Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                Err(_) => break,
            }
            if frames.len() == 3 {
                break;
            }
        }

        assert_eq!(frames, vec![&b"PKT-A"[..], &b"PKT-B"[..], &b"PKT-C"[..]]);
    }
}
