//! studysync-server - realtime study session coordination daemon

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studysync::auth::JwtVerifier;
use studysync::config::Config;
use studysync::engine::SessionEngine;
use studysync::registry::ConnectionRegistry;
use studysync::server::ServerListener;
use studysync::store::MemoryStore;
use studysync::sweeper::Sweeper;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "studysync-server")]
#[command(about = "studysync realtime coordination server")]
struct Cli {
    /// Config file path override
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address override (host:port)
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    tracing::info!("Starting studysync server on {}", config.server.listen_addr);

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let engine = Arc::new(SessionEngine::new(store, registry));
    let verifier = Arc::new(JwtVerifier::new(&config.auth.jwt_secret));

    let sweep_period = Duration::from_secs(config.session.sweep_interval_secs);
    let sweeper = Sweeper::new(Arc::clone(&engine), sweep_period);
    let (sweeper_shutdown_tx, sweeper_shutdown_rx) = mpsc::channel(1);
    let sweeper_handle = tokio::spawn(async move { sweeper.run(sweeper_shutdown_rx).await });

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    let listener = ServerListener::new(config, engine, verifier);
    listener.run(shutdown_rx).await?;

    let _ = sweeper_shutdown_tx.send(()).await;
    let _ = sweeper_handle.await;

    Ok(())
}
