//! WebRTC broadcast core
//!
//! One capture source feeds every connected browser:
//! ```text
//! MediaSource (H.264 access units / Opus packets)
//!        |
//!        v
//! BroadcastManager (one paced loop per media kind)
//!        |
//!        +--> PeerSession --> MediaTrack --> RTCPeerConnection
//!        +--> PeerSession --> MediaTrack --> RTCPeerConnection
//!        |
//! Browser <-------- SDP / ICE over WebSocket ------- SignalingController
//! ```
//!
//! Loops start on the first connected session and stop once the registry
//! is empty.

pub mod config;
pub mod controller;
pub mod manager;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod track;

pub use config::{TurnServer, WebRtcConfig};
pub use controller::{transition, Action, IceState, SignalingController, SignalingEvent, SignalingState};
pub use manager::{frame_period, BroadcastManager, BroadcastStats, LoopStats};
pub use peer::{PeerEvent, RtcPeer};
pub use session::{ConnectionId, PeerSession, SessionInfo};
pub use signaling::{
    inspect_offer, IceCandidate, OfferMedia, SdpAnswer, SdpOffer, SignalingError,
    SignalingMessage,
};
pub use track::{
    CodecDescriptor, MediaTrack, PlayoutDelayExtension, RtcSampleSink, SampleSink,
    TrackStatsSnapshot, PLAYOUT_DELAY_URI,
};
