//! Signaling state machine
//!
//! One [`SignalingController`] per signaling socket. ICE connection state
//! changes are turned into [`SignalingEvent`]s; [`transition`] maps the
//! current state and an event to the next state plus the actions to run
//! against the [`BroadcastManager`].
//!
//! ```text
//!  New --offer accepted--> Negotiating --ICE connected--> Connected
//!                               |                           |
//!                               +------ICE disconnected-----+--> Disconnected
//!                               +------ICE failed-----------+--> Failed
//!  any --close--> Closed
//! ```

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::manager::BroadcastManager;
use super::session::{ConnectionId, PeerSession};
use crate::error::Result;

/// Signaling connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingState::New => write!(f, "new"),
            SignalingState::Negotiating => write!(f, "negotiating"),
            SignalingState::Connected => write!(f, "connected"),
            SignalingState::Disconnected => write!(f, "disconnected"),
            SignalingState::Failed => write!(f, "failed"),
            SignalingState::Closed => write!(f, "closed"),
        }
    }
}

/// ICE connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Input of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Offer answered and session built
    OfferAccepted,
    IceConnected,
    IceDisconnected,
    IceFailed,
    /// Socket closed or peer connection closed
    Close,
}

impl SignalingEvent {
    /// Events raised by an ICE state; checking/new raise none
    pub fn from_ice(state: IceState) -> Option<Self> {
        match state {
            IceState::Connected | IceState::Completed => Some(Self::IceConnected),
            IceState::Disconnected => Some(Self::IceDisconnected),
            IceState::Failed => Some(Self::IceFailed),
            IceState::Closed => Some(Self::Close),
            IceState::New | IceState::Checking => None,
        }
    }
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RegisterSession,
    StartLoops,
    RemoveSession,
}

/// Next state and actions for `event` in `state`
///
/// Events that do not apply leave the state unchanged with no actions.
pub fn transition(state: SignalingState, event: SignalingEvent) -> (SignalingState, Vec<Action>) {
    use Action::*;
    use SignalingEvent as E;
    use SignalingState as S;

    match (state, event) {
        (S::Closed, _) => (S::Closed, vec![]),
        (_, E::Close) => (S::Closed, vec![RemoveSession]),

        (S::New, E::OfferAccepted) => (S::Negotiating, vec![RegisterSession]),

        (S::Negotiating, E::IceConnected) => (S::Connected, vec![StartLoops]),
        // ICE restored a path after a transient loss
        (S::Disconnected, E::IceConnected) => (S::Connected, vec![RegisterSession, StartLoops]),

        (S::Negotiating | S::Connected, E::IceDisconnected) => {
            (S::Disconnected, vec![RemoveSession])
        }
        (S::Negotiating | S::Connected | S::Disconnected, E::IceFailed) => {
            (S::Failed, vec![RemoveSession])
        }

        (state, _) => (state, vec![]),
    }
}

/// Drives one peer's lifecycle against the broadcast manager
pub struct SignalingController {
    id: ConnectionId,
    state: SignalingState,
    manager: Arc<BroadcastManager>,
    session: Option<Arc<PeerSession>>,
}

impl SignalingController {
    pub fn new(id: ConnectionId, manager: Arc<BroadcastManager>) -> Self {
        Self {
            id,
            state: SignalingState::New,
            manager,
            session: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// Offers are only taken in the `New` state
    pub fn accepts_offer(&self) -> bool {
        self.state == SignalingState::New
    }

    /// Register the session built from an answered offer
    ///
    /// On a registration error the controller stays in `New`.
    pub async fn accept_session(&mut self, session: Arc<PeerSession>) -> Result<()> {
        self.session = Some(session);
        if let Err(e) = self.handle(SignalingEvent::OfferAccepted).await {
            self.session = None;
            self.state = SignalingState::New;
            return Err(e);
        }
        Ok(())
    }

    pub async fn on_ice_state(&mut self, ice: IceState) -> Result<()> {
        debug!("Peer {} ICE state {:?}", self.id.short(), ice);
        match SignalingEvent::from_ice(ice) {
            Some(event) => self.handle(event).await,
            None => Ok(()),
        }
    }

    /// Idempotent teardown
    pub async fn close(&mut self) {
        // Close only removes the session, which cannot fail
        let _ = self.handle(SignalingEvent::Close).await;
    }

    /// Apply `event` and run the resulting actions
    pub async fn handle(&mut self, event: SignalingEvent) -> Result<()> {
        let (next, actions) = transition(self.state, event);
        if next != self.state {
            info!("Peer {} {} -> {}", self.id.short(), self.state, next);
        }
        self.state = next;

        for action in actions {
            match action {
                Action::RegisterSession => match &self.session {
                    Some(session) => self.manager.add_session(session.clone()).await?,
                    None => warn!("Peer {} has no session to register", self.id.short()),
                },
                Action::StartLoops => {
                    self.manager.start_video_loop();
                    self.manager.start_audio_loop();
                }
                Action::RemoveSession => {
                    self.manager.remove_session(&self.id);
                }
            }
        }
        Ok(())
    }
}
