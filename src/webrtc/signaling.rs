//! WebRTC signaling types and messages

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP Offer from client
    Offer(SdpOffer),
    /// SDP Answer from server
    Answer(SdpAnswer),
    /// ICE candidate
    Candidate(IceCandidate),
    /// Connection error
    Error(SignalingError),
    /// Connection closed
    Close,
}

/// SDP Offer from client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    /// SDP content
    pub sdp: String,
}

/// SDP Answer from server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    /// SDP content
    pub sdp: String,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// ICE candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

/// Signaling error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingError {
    /// Error code
    pub code: u32,
    /// Error message
    pub message: String,
}

impl SignalingError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_offer(reason: impl std::fmt::Display) -> Self {
        Self::new(400, format!("Invalid SDP offer: {}", reason))
    }

    pub fn connection_failed(reason: impl std::fmt::Display) -> Self {
        Self::new(500, format!("Connection failed: {}", reason))
    }
}

/// Media kinds a browser offer asks to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OfferMedia {
    pub video: bool,
    pub audio: bool,
}

/// Inspect an SDP offer for the media sections the answer has to serve
///
/// Video is mandatory. Audio counts only when its section is active
/// (port != 0) and the browser is willing to receive (`recvonly` or
/// `sendrecv`).
pub fn inspect_offer(sdp: &str) -> Result<OfferMedia> {
    if !sdp.trim_start().starts_with("v=0") {
        return Err(AppError::Negotiation("not an SDP session description".into()));
    }

    let mut media = OfferMedia::default();
    let mut session_direction = Direction::SendRecv;
    let mut section: Option<MediaSection> = None;

    for line in sdp.lines().map(str::trim) {
        if let Some(m) = line.strip_prefix("m=") {
            if let Some(done) = section.take() {
                done.apply(&mut media);
            }
            section = Some(MediaSection::parse(m, session_direction));
        } else if let Some(direction) = Direction::from_attribute(line) {
            match section.as_mut() {
                Some(s) => s.direction = direction,
                None => session_direction = direction,
            }
        }
    }
    if let Some(done) = section.take() {
        done.apply(&mut media);
    }

    if !media.video {
        return Err(AppError::Negotiation("offer has no video section".into()));
    }
    Ok(media)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn from_attribute(line: &str) -> Option<Self> {
        match line {
            "a=sendrecv" => Some(Self::SendRecv),
            "a=sendonly" => Some(Self::SendOnly),
            "a=recvonly" => Some(Self::RecvOnly),
            "a=inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    /// The offerer can receive what we send
    fn receives(self) -> bool {
        matches!(self, Self::SendRecv | Self::RecvOnly)
    }
}

struct MediaSection {
    kind: String,
    active: bool,
    direction: Direction,
}

impl MediaSection {
    fn parse(m_line: &str, default_direction: Direction) -> Self {
        let mut fields = m_line.split_whitespace();
        let kind = fields.next().unwrap_or_default().to_string();
        let active = fields.next().map(|port| port != "0").unwrap_or(false);
        Self {
            kind,
            active,
            direction: default_direction,
        }
    }

    fn apply(self, media: &mut OfferMedia) {
        if !self.active {
            return;
        }
        match self.kind.as_str() {
            "video" => media.video = true,
            "audio" => media.audio |= self.direction.receives(),
            _ => {}
        }
    }
}
