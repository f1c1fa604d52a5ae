//! Video config handlers

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::config::VideoConfig;
use crate::error::Result;
use crate::state::AppState;

use super::types::VideoConfigUpdate;

/// Get video config
pub async fn get_video_config(State(state): State<Arc<AppState>>) -> Json<VideoConfig> {
    Json(state.config.get().video.clone())
}

/// Update video config
///
/// The running video loop polls the frame rate through the config store, so a
/// new `fps` applies from its next tick.
pub async fn update_video_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VideoConfigUpdate>,
) -> Result<Json<VideoConfig>> {
    req.validate()?;

    state
        .config
        .update(|config| {
            req.apply_to(&mut config.video);
        })
        .await?;

    let video = state.config.get().video.clone();
    tracing::info!(
        "Video config updated: {}x{} @ {} fps, {} kbps",
        video.width,
        video.height,
        video.fps,
        video.bitrate_kbps
    );
    Ok(Json(video))
}
