//! callsync-server - Server Ingest API
//!
//! Receives call metadata and recordings from paired devices. Also carries
//! two provisioning subcommands standing in for an admin panel.

use anyhow::{Context, Result};
use callsync_common::config::user_config_file;
use callsync_server::config::{ServerConfig, CONFIG_FILE_NAME};
use callsync_server::db::{self, employees};
use callsync_server::storage::RecordingStorage;
use callsync_server::{build_router, AppState};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for callsync-server
#[derive(Parser, Debug)]
#[command(name = "callsync-server")]
#[command(about = "Call and recording ingest server")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "CALLSYNC_PORT")]
    port: Option<u16>,

    /// Root folder holding the database, recordings and temp chunks
    #[arg(short, long, env = "CALLSYNC_ROOT")]
    root_folder: Option<String>,

    /// Public origin used in recording URLs
    #[arg(short, long, env = "CALLSYNC_BASE_URL")]
    base_url: Option<String>,

    /// TOML config file (default: ~/.config/callsync/server.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or rename an employee of an organisation
    AddEmployee {
        #[arg(long)]
        org: String,
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: String,
    },
    /// Exclude a phone number from tracking for an organisation
    ExcludeNumber {
        #[arg(long)]
        org: String,
        #[arg(long)]
        phone: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting callsync-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();
    let config_file = args.config.clone().or_else(|| user_config_file(CONFIG_FILE_NAME));
    let config = ServerConfig::resolve(
        args.port,
        args.root_folder.as_deref(),
        args.base_url.as_deref(),
        config_file.as_deref(),
    );

    std::fs::create_dir_all(&config.root_folder)
        .with_context(|| format!("Failed to create root folder {}", config.root_folder.display()))?;
    info!("Root folder: {}", config.root_folder.display());

    let pool = match db::init_database(&config.database_path()).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };

    match args.command {
        Some(Command::AddEmployee { org, id, name }) => {
            employees::upsert_employee(&pool, &org, id, &name).await?;
            info!(org_id = %org, user_id = id, "Employee saved");
            return Ok(());
        }
        Some(Command::ExcludeNumber { org, phone }) => {
            employees::add_excluded_contact(&pool, &org, &phone).await?;
            info!(org_id = %org, phone = %phone, "Number excluded");
            return Ok(());
        }
        None => {}
    }

    let storage = RecordingStorage::new(&config.root_folder);
    let state = AppState::new(pool, storage, &config.base_url);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("callsync-server listening on http://{}", addr);
    info!("Recording URLs use base {}", config.base_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
