use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::ConfigStore;
use crate::webrtc::BroadcastManager;

/// Application-wide state shared across handlers
///
/// Every signaling socket registers its peer with `broadcast`; the HTTP
/// handlers read status from it and write encoder settings through `config`.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Session registry and broadcast loops
    pub broadcast: Arc<BroadcastManager>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        broadcast: Arc<BroadcastManager>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            broadcast,
            shutdown_tx,
        })
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
