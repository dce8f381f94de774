#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # kubesock
//!
//! Bridges a Kubernetes cluster to browser clients over WebSocket streams:
//! resource CRUD and Helm releases as request/reply, pod logs as a line
//! stream, and container shells as an interactive terminal.
//!
//! A client first calls a creation endpoint, gets a session id back, then
//! opens the matching stream endpoint and sends `{"op":"bind","sessionId":..}`
//! within the bind deadline. See [`kubesock::routes`] for the surface.
//!
//! ## Subcommands
//!
//! - `kubesock serve` (default): run the HTTP/WS server

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use kubesock::protocol::CloseStatus;
use kubesock::{routes, AppState, Backends, Config};

/// Kubernetes session bridge.
#[derive(Parser)]
#[command(name = "kubesock", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };

    if let Err(e) = run_server(config_path.as_deref()).await {
        error!("{e}");
        eprintln!("kubesock: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path).map_err(|e| e.to_string())?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("kubesock v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.api_key.is_none() {
        warn!("No API key configured, creation calls and streams are open");
    }

    let backends = Backends::from_config(&config).map_err(|e| e.to_string())?;
    let state = AppState::new(config, backends);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", state.config.server.listen))?;

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("server error: {e}"))?;

    info!("Shutting down...");
    state
        .sessions
        .terminate_all(CloseStatus::Warning, "Server shutting down")
        .await;
    info!("Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
