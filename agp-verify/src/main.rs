//! agp-verify - Batch/Stage Verification & Moderation service
//!
//! Startup: configuration, root folder, database, external collaborators,
//! then the HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;

use agp_common::config::{default_config_path, load_toml_config, resolve_root_folder, RootFolder, TomlConfig};
use agp_common::db::init_database;
use agp_common::events::EventBus;
use agp_verify::db::certificates;
use agp_verify::services::{Collaborators, Workflow, WorkflowLimits};
use agp_verify::{build_router, AppState};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

/// Buffered events per SSE subscriber before it starts lagging
const EVENT_BUS_CAPACITY: usize = 1024;

/// Command-line arguments for agp-verify
#[derive(Parser, Debug)]
#[command(name = "agp-verify")]
#[command(about = "Batch verification and moderation service for AgriProv")]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "AGP_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database and locally stored images
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = "AGP_VERIFY_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match args.config.clone().or_else(default_config_path) {
        Some(path) => load_toml_config(&path).context("Failed to load configuration")?,
        None => TomlConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agp_verify={0},agp_common={0},tower_http=info", config.logging.level).into()),
        )
        .init();

    info!("Starting AgriProv verification service (agp-verify) v{}", env!("CARGO_PKG_VERSION"));

    let root = RootFolder::new(resolve_root_folder(args.root_folder.as_deref(), &config));
    root.ensure_directory_exists()?;
    info!("Root folder: {}", root.path().display());

    let db_path = root.database_path();
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    info!("Database: {}", db_path.display());

    let cleared = certificates::clear_interrupted_claims(&pool).await?;
    if cleared > 0 {
        warn!(cleared, "Dropped certificate issuance claims interrupted by a previous shutdown");
    }

    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let collaborators = Collaborators::from_config(&config.services, &config.limits, &root.images_dir(), event_bus.clone())?;
    let workflow = Workflow::new(
        pool.clone(),
        event_bus.clone(),
        collaborators,
        WorkflowLimits::from(&config.limits),
        config.triage.clone(),
    )
    .await?;

    let app = build_router(
        AppState::new(pool, event_bus, workflow).with_max_request_bytes(config.limits.max_request_bytes),
    );

    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("agp-verify listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("agp-verify stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
