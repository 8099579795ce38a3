//! twinforge-scan - Body scan microservice
//!
//! Serves the scan pipeline endpoints: measurement estimate, semantic
//! classification, archetype match, morph refinement and commit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twinforge_common::config::{database_path, resolve_root_folder, Environment, TomlConfig};
use twinforge_scan::config::{resolve_service_settings, resolve_vision_settings, DEFAULT_PORT};
use twinforge_scan::services::OpenAiClient;
use twinforge_scan::AppState;

/// Command-line arguments for twinforge-scan
#[derive(Parser, Debug)]
#[command(name = "twinforge-scan")]
#[command(about = "Body scan pipeline microservice for TwinForge")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TWINFORGE_SCAN_PORT")]
    port: Option<u16>,

    /// Folder holding the database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Deployment environment (production disables the mock user)
    #[arg(short, long)]
    environment: Option<Environment>,

    /// Configuration file (defaults to the platform location)
    #[arg(short, long, env = "TWINFORGE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = match &args.config {
        Some(path) => TomlConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => TomlConfig::load_or_default(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("twinforge_scan={},tower_http=debug", toml_config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = args.port.or(toml_config.port).unwrap_or(DEFAULT_PORT);
    info!("Starting twinforge-scan on port {}", port);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), "TWINFORGE_ROOT_FOLDER", &toml_config);
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;

    let db_path = database_path(&root_folder);
    info!("Database: {}", db_path.display());
    let db = twinforge_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let settings = resolve_service_settings(args.environment, &toml_config);
    info!(environment = ?settings.environment, mock_user = settings.mock_user_id.is_some(), "Service settings resolved");

    let vision_settings = resolve_vision_settings(&db, &toml_config)
        .await
        .context("Failed to resolve vision settings")?;
    info!(model = %vision_settings.model, rpm = vision_settings.requests_per_minute, "Vision model configured");
    let vision = OpenAiClient::new(&vision_settings).context("Failed to build vision client")?;

    let state = AppState::new(db, Arc::new(vision), settings);
    let app = twinforge_scan::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
