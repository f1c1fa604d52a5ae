//! webrtc-rs peer connection adapter
//!
//! Builds the peer connection for one signaling socket, answers the offer
//! with one video track (and one audio track when the offer asks for it) and
//! reports ICE state and local candidates as [`PeerEvent`]s.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::controller::IceState;
use super::session::{ConnectionId, PeerSession};
use super::signaling::{IceCandidate, OfferMedia, SdpAnswer, SdpOffer};
use super::track::{MediaTrack, RtcSampleSink, PLAYOUT_DELAY_URI};
use crate::error::{AppError, Result};
use crate::media::MediaKind;

/// Stream id shared by the tracks of one peer
const STREAM_ID: &str = "kvm-broadcast";

/// Transport notification for the signaling socket
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceState(IceState),
    LocalCandidate(IceCandidate),
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    match state {
        RTCIceConnectionState::New => Some(IceState::New),
        RTCIceConnectionState::Checking => Some(IceState::Checking),
        RTCIceConnectionState::Connected => Some(IceState::Connected),
        RTCIceConnectionState::Completed => Some(IceState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceState::Failed),
        RTCIceConnectionState::Closed => Some(IceState::Closed),
        _ => None,
    }
}

/// One webrtc-rs peer connection
pub struct RtcPeer {
    id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    playout_delay: bool,
}

impl RtcPeer {
    /// Create the peer connection and hook its callbacks to `events`
    pub async fn new(
        id: ConnectionId,
        config: &WebRtcConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        if config.playout_delay {
            media_engine
                .register_header_extension(
                    RTCRtpHeaderExtensionCapability {
                        uri: PLAYOUT_DELAY_URI.to_owned(),
                    },
                    RTPCodecType::Video,
                    None,
                )
                .map_err(|e| {
                    AppError::WebRtcError(format!("Failed to register playout delay: {}", e))
                })?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: Self::ice_servers(config),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = Self {
            id,
            pc: Arc::new(pc),
            playout_delay: config.playout_delay,
        };
        peer.setup_event_handlers(events);
        Ok(peer)
    }

    fn ice_servers(config: &WebRtcConfig) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];
        for stun_url in &config.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &config.turn_servers {
            if !turn.has_credentials() {
                warn!(
                    "Skipping TURN server {:?} - credentials required but missing",
                    turn.urls
                );
                continue;
            }
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        ice_servers
    }

    fn setup_event_handlers(&self, events: mpsc::UnboundedSender<PeerEvent>) {
        let short = self.id.short();

        let state_events = events.clone();
        let state_id = short.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let events = state_events.clone();
                let id = state_id.clone();
                Box::pin(async move {
                    debug!("[ICE] Peer {} connection state: {}", id, state);
                    if let Some(state) = map_ice_state(state) {
                        let _ = events.send(PeerEvent::IceState(state));
                    }
                })
            }));

        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let id = short.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        debug!("[ICE] Peer {} gathering complete", id);
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            debug!("[ICE] Peer {} local candidate: {}", id, init.candidate);
                            let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!("[ICE] Peer {} candidate not serializable: {}", id, e),
                    }
                })
            }));
    }

    async fn add_track(&self, kind: MediaKind) -> Result<MediaTrack> {
        let local = RtcSampleSink::local_track(kind, STREAM_ID);
        let sender: Arc<RTCRtpSender> = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add {} track: {}", kind, e)))?;

        // Interceptors (NACK, reports) only run while incoming RTCP is read
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let sink = Arc::new(RtcSampleSink::new(local, sender));
        Ok(MediaTrack::new(kind, sink, self.playout_delay))
    }

    /// Answer `offer` and build the session
    ///
    /// The video track is always added; the audio track only when the offer
    /// can receive audio and `with_audio` is set.
    pub async fn negotiate(
        &self,
        offer: &SdpOffer,
        media: OfferMedia,
        with_audio: bool,
        remote_addr: Option<String>,
    ) -> Result<(SdpAnswer, Arc<PeerSession>)> {
        let video = self.add_track(MediaKind::Video).await?;
        let audio = if media.audio && with_audio {
            Some(self.add_track(MediaKind::Audio).await?)
        } else {
            None
        };

        let sdp = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| AppError::Negotiation(format!("Invalid SDP offer: {}", e)))?;
        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;

        let sdp = match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => answer.sdp,
        };

        info!(
            "Peer {} answered (audio: {})",
            self.id.short(),
            audio.is_some()
        );
        let session = Arc::new(PeerSession::new(self.id, remote_addr, video, audio));
        Ok((SdpAnswer::new(sdp), session))
    }

    /// Add a remote (trickled) ICE candidate
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Peer {} close: {}", self.id.short(), e);
        }
    }
}
