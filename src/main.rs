use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kvm_broadcast::config::ConfigStore;
use kvm_broadcast::media::{MediaSource, PipeSource};
use kvm_broadcast::state::AppState;
use kvm_broadcast::web;
use kvm_broadcast::webrtc::BroadcastManager;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// kvm-broadcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "kvm-broadcast")]
#[command(version, about = "WebRTC media broadcast for IP-KVM appliances", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Data directory path (default: /etc/kvm-broadcast)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// H.264 Annex-B input, FIFO or file (overrides database config)
    #[arg(long, value_name = "PATH")]
    video_path: Option<String>,

    /// Ogg/Opus input, FIFO or file (overrides database config)
    #[arg(long, value_name = "PATH")]
    audio_path: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting kvm-broadcast v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg takes precedence
    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("kvm-broadcast.db")).await?;

    // Apply CLI argument overrides to config (only if explicitly specified)
    if args.address.is_some()
        || args.http_port.is_some()
        || args.video_path.is_some()
        || args.audio_path.is_some()
    {
        config_store
            .update(|config| {
                if let Some(addr) = args.address {
                    config.web.bind_address = addr;
                }
                if let Some(port) = args.http_port {
                    config.web.http_port = port;
                }
                if let Some(path) = args.video_path {
                    config.source.video_path = Some(path);
                }
                if let Some(path) = args.audio_path {
                    config.source.audio_path = Some(path);
                }
            })
            .await?;
    }
    let config = config_store.get();

    let ip = config
        .web
        .bind_address
        .parse::<IpAddr>()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);

    let source = Arc::new(PipeSource::new(config_store.clone())?);
    let profile = source.video_profile();
    tracing::info!(
        "Video source: {} ({}x{} @ {} fps)",
        config.source.video_path.as_deref().unwrap_or("<none>"),
        profile.width,
        profile.height,
        profile.fps
    );

    let audio_frame = Duration::from_millis(config.audio.frame_duration_ms.max(1) as u64);
    let broadcast_manager = BroadcastManager::new(source, audio_frame);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(config_store, broadcast_manager, shutdown_tx);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = web::serve(listener, state.clone(), shutdown_signal).await {
        tracing::error!("HTTP server error: {}", e);
    }

    cleanup(&state);
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "kvm_broadcast=error,tower_http=error",
        LogLevel::Warn => "kvm_broadcast=warn,tower_http=warn",
        LogLevel::Info => "kvm_broadcast=info,tower_http=info",
        LogLevel::Verbose => "kvm_broadcast=debug,tower_http=info",
        LogLevel::Debug => "kvm_broadcast=debug,tower_http=debug",
        LogLevel::Trace => "kvm_broadcast=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("KVM_BROADCAST_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/kvm-broadcast")
}

/// Drop every peer; the broadcast loops wind down once the registry is empty
fn cleanup(state: &Arc<AppState>) {
    let closed = state.broadcast.close_all();
    tracing::info!("Closed {} peer session(s)", closed);
}
