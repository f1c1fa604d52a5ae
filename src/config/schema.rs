use serde::{Deserialize, Serialize};

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::WebRtcConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Encoded video settings handed to the capture pipeline
    pub video: VideoConfig,
    /// Audio settings
    pub audio: AudioConfig,
    /// Media source locations
    pub source: SourceConfig,
    /// WebRTC settings (ICE servers, extensions)
    pub webrtc: WebRtcConfig,
    /// Web server settings
    pub web: WebConfig,
}

/// Video stream configuration
///
/// `fps` is re-read by the running video loop on every tick, so changing it
/// takes effect without restarting the broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VideoConfig {
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: 4000,
        }
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AudioConfig {
    /// Offer an audio track to peers that negotiate one
    pub enabled: bool,
    /// Opus frame duration in milliseconds (fixed for the life of the process)
    pub frame_duration_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frame_duration_ms: 20,
        }
    }
}

/// Media source configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    /// H.264 Annex-B byte stream (FIFO written by the encoder, or a file)
    pub video_path: Option<String>,
    /// Ogg/Opus stream
    pub audio_path: Option<String>,
    /// Rewind regular files at EOF instead of waiting for a new writer
    pub loop_playback: bool,
    /// Units buffered between the reader thread and the broadcast loop
    pub queue_depth: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            video_path: None,
            audio_path: None,
            loop_playback: false,
            queue_depth: 4,
        }
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind address
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"video":{"fps":60},"web":{"http_port":9000}}"#).unwrap();
        assert_eq!(config.video.fps, 60);
        assert_eq!(config.video.width, 1920);
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.audio.frame_duration_ms, 20);
        assert!(config.source.video_path.is_none());
    }
}
