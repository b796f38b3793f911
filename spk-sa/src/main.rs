//! spk-sa - Session Analysis service
//!
//! Accepts recordings, runs the analysis stage pipeline against the external ML service
//! and streams progressive results to clients over SSE.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use spk_common::config::{load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spk_sa::adapter::HttpMlAdapter;
use spk_sa::config::ServiceConfig;
use spk_sa::AppState;

const MODULE_NAME: &str = "spk-sa";

/// Command-line arguments for spk-sa
#[derive(Parser, Debug)]
#[command(name = "spk-sa")]
#[command(about = "Session analysis service for SPK")]
#[command(version)]
struct Args {
    /// Root folder holding the database and uploaded audio
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Config file (default: ~/.config/spk/spk-sa.toml)
    #[arg(short, long, env = "SPK_SA_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides env and config file)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolver = RootFolderResolver::new(MODULE_NAME);
    let toml_config = match &args.config {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => resolver.load_config(),
    };

    init_tracing(&toml_config)?;

    info!("Starting {} (Session Analysis) v{}", MODULE_NAME, env!("CARGO_PKG_VERSION"));
    info!("Build: {} ({})", env!("SPK_GIT_HASH"), env!("SPK_BUILD_TIMESTAMP"));

    // Step 1: Resolve root folder (CLI → ENV → TOML → default)
    let root_folder = args
        .root_folder
        .unwrap_or_else(|| resolver.resolve_with(&toml_config));

    // Step 2: Create root folder and uploads directory if missing
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    let uploads_dir = initializer.uploads_dir();
    std::fs::create_dir_all(&uploads_dir)
        .with_context(|| format!("Failed to create uploads directory {}", uploads_dir.display()))?;
    info!("Root folder: {}", initializer.root_folder().display());

    // Step 3: Resolve service configuration
    let mut config = ServiceConfig::resolve(&toml_config).context("Invalid configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    // Step 4: Open or create database
    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = spk_sa::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Step 5: ML service adapter and application state
    let adapter = HttpMlAdapter::new(&config.ml_service_url, config.ml_connect_timeout)
        .context("Failed to build ML service client")?;
    let listen_address = config.listen_address();
    let resume = config.resume_interrupted_on_startup;
    let state = AppState::new(db_pool, config, Arc::new(adapter), uploads_dir);

    if resume {
        match state.orchestrator.resume_interrupted().await {
            Ok(0) => {}
            Ok(count) => info!("Resumed {} interrupted session(s)", count),
            Err(e) => {
                warn!("Failed to resume interrupted sessions: {}", e);
                state.record_error(format!("Resume failed: {}", e)).await;
            }
        }
    }

    let app = spk_sa::build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("Failed to bind to {}", listen_address))?;
    info!("Listening on http://{}", listen_address);
    info!("Health check: http://{}/health", listen_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Console logging, plus a plain-text file when the config names one
fn init_tracing(toml_config: &TomlConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &toml_config.logging.level;
        format!("spk_sa={level},spk_common={level},tower_http=info").into()
    });

    let file_layer = match &toml_config.logging.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
