//! WebRTC configuration

use serde::{Deserialize, Serialize};

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Ask receivers to render video with minimal buffering
    pub playout_delay: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Empty STUN servers for local connections - host candidates work directly
            // For remote access, configure STUN/TURN servers via settings
            stun_servers: vec![],
            turn_servers: vec![],
            playout_delay: true,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:3478?transport=tcp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }

    /// webrtc-rs refuses TURN servers without credentials
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.credential.is_empty()
    }
}

/// ICE server entry as handed to browsers (`RTCIceServer` shape)
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl WebRtcConfig {
    /// ICE servers for the browser side of the connection
    pub fn ice_servers(&self) -> Vec<IceServerInfo> {
        let stun = self.stun_servers.iter().map(|url| IceServerInfo {
            urls: vec![url.clone()],
            username: None,
            credential: None,
        });
        let turn = self
            .turn_servers
            .iter()
            .filter(|t| t.has_credentials())
            .map(|t| IceServerInfo {
                urls: t.urls.clone(),
                username: Some(t.username.clone()),
                credential: Some(t.credential.clone()),
            });
        stun.chain(turn).collect()
    }
}
