//! kodipd - MPD protocol bridge for Kodi
//!
//! Binds the MPD listener, starts the Kodi poller and serves client
//! sessions until SIGINT/SIGTERM.

use kodipd::{command, config, kodi, paths, server, state};

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kodipd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting kodipd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::load_config()?;
    tracing::info!(
        "Configuration loaded, bridging {}:{} to kodi at {}:{}",
        config.listen_host,
        config.port,
        config.kodi_host,
        config.kodi_port
    );

    let kodi = kodi::KodiClient::new(
        &config.kodi_host,
        config.kodi_port,
        config.kodi_username.clone(),
        config.kodi_password.clone(),
    );
    let paths = paths::PathTranslator::new(&config.music_root, &config.path_separator);
    let cache = state::StateCache::shared(kodi.clone(), paths.clone());
    let bridge = Arc::new(command::Bridge {
        kodi,
        cache: cache.clone(),
        paths,
    });

    // Warm the cache; Kodi being down at startup is not fatal, the
    // poller keeps trying
    if let Err(e) = cache.refresh().await {
        tracing::warn!("initial kodi refresh failed: {}", e);
    }

    let shutdown = CancellationToken::new();
    let poller = tokio::spawn(state::run_poller(
        cache,
        config.poll_interval(),
        shutdown.clone(),
    ));

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.listen_host, config.port)).await?;
    let listener_task = tokio::spawn(server::serve(listener, bridge, shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    listener_task.await??;
    poller.await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
