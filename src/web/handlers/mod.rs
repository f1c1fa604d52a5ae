pub mod config;

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;
use crate::webrtc::config::IceServerInfo;
use crate::webrtc::{BroadcastStats, SessionInfo};

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Stream
// ============================================================================

/// Broadcast loop and registry status
pub async fn stream_status(State(state): State<Arc<AppState>>) -> Json<BroadcastStats> {
    Json(state.broadcast.stats())
}

/// Registered peer sessions
pub async fn stream_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.broadcast.list_sessions())
}

// ============================================================================
// WebRTC
// ============================================================================

#[derive(Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServerInfo>,
}

/// ICE servers the browser should use for its side of the connection
pub async fn webrtc_ice_servers(State(state): State<Arc<AppState>>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.get().webrtc.ice_servers(),
    })
}
