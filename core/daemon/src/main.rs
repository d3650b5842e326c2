//! Beacon daemon entrypoint.
//!
//! One listening process per machine per cache namespace: consult the
//! discovery files, bind loopback, advertise the triple, serve until
//! SIGTERM/SIGINT, then drain voice and clear the triple on the way out.

use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod bus;
mod config;
mod discovery;
mod pipeline;
mod server;
mod store;
mod voice;

use config::{Cli, Config};
use discovery::DiscoveryDir;
use pipeline::EnrichDefaults;
use server::AppState;
use store::EventStore;
use voice::{PlaybackConfig, VoiceService};

#[derive(Debug, Error)]
enum DaemonError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Discovery(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

fn main() -> ExitCode {
    init_logging();

    let config = match Config::resolve(Cli::parse()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to resolve configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Daemon failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: Config) -> Result<(), DaemonError> {
    let discovery = DiscoveryDir::new(config.cache_dir.clone());
    discovery::ensure_sole_owner(&discovery).map_err(DaemonError::Discovery)?;

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| DaemonError::Bind { addr, source })?;
    let local_addr = listener.local_addr().map_err(DaemonError::Serve)?;

    let nonce = discovery
        .write_triple(local_addr.port(), std::process::id())
        .map_err(DaemonError::Discovery)?;

    let store = match &config.journal {
        Some(path) => EventStore::with_journal(config.capacity, path.clone()),
        None => EventStore::new(config.capacity),
    };
    let voice = VoiceService::new(
        config.voice_enabled,
        config.clips_dir(),
        PlaybackConfig::default(),
    );
    let state = AppState::new(
        store,
        voice,
        nonce,
        EnrichDefaults {
            app: config.default_app.clone(),
            app_root: config.default_app_root.clone(),
        },
    );
    let router = server::build_router(state.clone(), config.assets.clone());

    info!(
        addr = %local_addr,
        capacity = config.capacity,
        journal = ?config.journal,
        voice = state.voice().mode(),
        "Beacon daemon started"
    );

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    state.voice().stop();
    discovery.clear();
    info!("Beacon daemon stopped");

    serve_result.map_err(DaemonError::Serve)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received; shutting down"),
        _ = terminate => info!("SIGTERM received; shutting down"),
    }
}
