use axum::{
    routing::{any, get, patch},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::signaling_ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(handlers::health_check))
        // Broadcast status
        .route("/stream/status", get(handlers::stream_status))
        .route("/stream/sessions", get(handlers::stream_sessions))
        // Encoder configuration
        .route("/config/video", get(handlers::config::get_video_config))
        .route("/config/video", patch(handlers::config::update_video_config))
        // WebRTC signaling
        .route("/webrtc/ice-servers", get(handlers::webrtc_ice_servers))
        .route("/webrtc/ws", any(signaling_ws_handler));

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Upper bound on waiting for signaling sockets to say goodbye
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Serve the API until `signal` resolves
///
/// On shutdown the signal is broadcast to every signaling socket, the
/// listener stops accepting and in-flight requests complete. Upgraded
/// sockets each hold a clone of `state`, so the call returns once the clone
/// count is back to what the caller passed in, or after [`DRAIN_TIMEOUT`].
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let baseline = Arc::strong_count(&state);
    let app = create_router(state.clone());
    let shutdown_tx = state.shutdown_tx.clone();

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        signal.await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    })
    .await?;

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while Arc::strong_count(&state) > baseline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Signaling sockets still open after {:?}", DRAIN_TIMEOUT);
    }
    Ok(())
}
