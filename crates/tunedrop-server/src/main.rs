use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunedrop::services::ConfigService;

mod api;
mod state;

#[derive(Parser)]
#[command(name = "tunedrop-server")]
#[command(about = "Convert media links to audio files and serve them until they expire")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); skipped if it does not exist
    #[arg(short, long, env = "TUNEDROP_CONFIG", default_value = "tunedrop.toml")]
    config: PathBuf,

    /// Address to listen on, overrides `server.bind`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config_service = ConfigService::new(&args.config);
    if !config_service.exists() {
        tracing::info!(
            "No config file at {}, using defaults and environment",
            args.config.display()
        );
    }
    let mut config = config_service.load()?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let state = state::AppState::from_config(config).await?;
    let sweeper = state.sweeper().start();
    let addr = state.config.server.bind.clone();
    let app = api::build_router(state);

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
