//! Peer sessions
//!
//! A [`PeerSession`] is what the broadcast loops see of one remote peer: its
//! identity and the tracks negotiated for it. The peer connection itself
//! stays with the signaling side.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::track::{MediaTrack, TrackStatsSnapshot};
use crate::media::MediaKind;

/// Identity of one signaling connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 hex digits, for log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One remote peer with its outbound tracks
pub struct PeerSession {
    id: ConnectionId,
    remote_addr: Option<String>,
    video: MediaTrack,
    audio: Option<MediaTrack>,
    created_at: DateTime<Utc>,
}

impl PeerSession {
    /// `audio` is `None` when the peer did not negotiate an audio transceiver
    pub fn new(
        id: ConnectionId,
        remote_addr: Option<String>,
        video: MediaTrack,
        audio: Option<MediaTrack>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            video,
            audio,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn video_track(&self) -> &MediaTrack {
        &self.video
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        match kind {
            MediaKind::Video => Some(&self.video),
            MediaKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            remote_addr: self.remote_addr.clone(),
            has_audio: self.has_audio(),
            created_at: self.created_at,
            video: self.video.stats(),
            audio: self.audio.as_ref().map(MediaTrack::stats),
        }
    }
}

/// Session summary for the status API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub remote_addr: Option<String>,
    pub has_audio: bool,
    pub created_at: DateTime<Utc>,
    pub video: TrackStatsSnapshot,
    pub audio: Option<TrackStatsSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::track::testing::RecordingSink;

    #[tokio::test]
    async fn test_audio_track_is_optional() {
        let video = MediaTrack::new(MediaKind::Video, RecordingSink::new(), true);
        let session = PeerSession::new(
            ConnectionId::new(),
            Some("10.0.0.7:51234".to_string()),
            video,
            None,
        );

        assert!(!session.has_audio());
        assert!(session.track(MediaKind::Audio).is_none());
        assert_eq!(session.track(MediaKind::Video).map(|t| t.kind()), Some(MediaKind::Video));

        let info = session.info();
        assert!(info.audio.is_none());
        assert_eq!(info.remote_addr.as_deref(), Some("10.0.0.7:51234"));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a.short().len(), 8);
        assert!(a.to_string().starts_with(&a.short()));
    }
}
