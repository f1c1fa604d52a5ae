//! Signaling WebSocket
//!
//! Endpoint `/api/webrtc/ws`. One socket carries one peer:
//! - client sends `offer`, server answers with `answer` or `error`
//! - both sides trickle `candidate` messages
//! - `close` (or the socket going away) tears the peer down
//!
//! ICE state changes of the peer connection drive the
//! [`SignalingController`], which registers the session and starts the
//! broadcast loops.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::state::AppState;
use crate::webrtc::{
    inspect_offer, ConnectionId, PeerEvent, RtcPeer, SdpOffer, SignalingController,
    SignalingError, SignalingMessage,
};

/// Heartbeat interval
const HEARTBEAT: std::time::Duration = std::time::Duration::from_secs(30);

/// WebSocket upgrade handler
pub async fn signaling_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Per-socket signaling state
struct SignalingSocket {
    state: Arc<AppState>,
    remote: SocketAddr,
    controller: SignalingController,
    peer: Option<RtcPeer>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let id = ConnectionId::new();
    let mut ctx = SignalingSocket {
        controller: SignalingController::new(id, state.broadcast.clone()),
        state: state.clone(),
        remote,
        peer: None,
        events_tx,
    };
    let mut shutdown_rx = state.shutdown_signal();

    info!("Signaling client {} connected from {}", id.short(), remote);

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !ctx.handle_text(&text, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        debug!("Received ping from client");
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!("Received pong from client");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Signaling client {} disconnected", id.short());
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Signaling receive error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            Some(event) = events_rx.recv() => {
                if ctx.peer.is_none() {
                    // Leftovers of a peer whose negotiation failed
                    continue;
                }
                match event {
                    PeerEvent::IceState(ice) => {
                        if let Err(e) = ctx.controller.on_ice_state(ice).await {
                            warn!("Peer {} state handling failed: {}", id.short(), e);
                        }
                    }
                    PeerEvent::LocalCandidate(candidate) => {
                        if send(&mut sender, &SignalingMessage::Candidate(candidate)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = send(&mut sender, &SignalingMessage::Close).await;
                break;
            }
        }
    }

    ctx.shutdown().await;
    debug!("Signaling handler {} exiting", id.short());
}

impl SignalingSocket {
    /// Returns `false` when the socket should close
    async fn handle_text(&mut self, text: &str, sender: &mut WsSender) -> bool {
        let msg: SignalingMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                let err = SignalingError::new(400, format!("Malformed message: {}", e));
                return send(sender, &SignalingMessage::Error(err)).await.is_ok();
            }
        };

        match msg {
            SignalingMessage::Offer(offer) => {
                let reply = match self.handle_offer(offer).await {
                    Ok(answer) => answer,
                    Err(err) => SignalingMessage::Error(err),
                };
                send(sender, &reply).await.is_ok()
            }
            SignalingMessage::Candidate(candidate) => {
                match &self.peer {
                    Some(peer) => {
                        if let Err(e) = peer.add_ice_candidate(candidate).await {
                            debug!("Peer {} rejected candidate: {}", self.controller.id().short(), e);
                        }
                    }
                    None => debug!("Candidate before offer ignored"),
                }
                true
            }
            SignalingMessage::Close => false,
            SignalingMessage::Answer(_) | SignalingMessage::Error(_) => {
                debug!("Unexpected client message ignored");
                true
            }
        }
    }

    /// Answer an offer; failures only concern this socket
    async fn handle_offer(
        &mut self,
        offer: SdpOffer,
    ) -> std::result::Result<SignalingMessage, SignalingError> {
        if !self.controller.accepts_offer() {
            return Err(SignalingError::new(400, "Offer already negotiated"));
        }

        let media = inspect_offer(&offer.sdp).map_err(signaling_error)?;

        let config = self.state.config.get();
        let id = self.controller.id();
        let peer = RtcPeer::new(id, &config.webrtc, self.events_tx.clone())
            .await
            .map_err(SignalingError::connection_failed)?;

        let negotiated = peer
            .negotiate(&offer, media, config.audio.enabled, Some(self.remote.to_string()))
            .await;
        let (answer, session) = match negotiated {
            Ok(result) => result,
            Err(e) => {
                peer.close().await;
                return Err(signaling_error(e));
            }
        };

        if let Err(e) = self.controller.accept_session(session).await {
            peer.close().await;
            return Err(SignalingError::connection_failed(e));
        }

        self.peer = Some(peer);
        Ok(SignalingMessage::Answer(answer))
    }

    async fn shutdown(&mut self) {
        self.controller.close().await;
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
    }
}

/// Negotiation problems are the client's (400), anything else is ours (500)
fn signaling_error(e: AppError) -> SignalingError {
    match e {
        AppError::Negotiation(reason) => SignalingError::invalid_offer(reason),
        other => SignalingError::connection_failed(other),
    }
}

async fn send(sender: &mut WsSender, msg: &SignalingMessage) -> std::result::Result<(), ()> {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize signaling message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await.map_err(|e| {
        debug!("Signaling send failed: {}", e);
    })
}
