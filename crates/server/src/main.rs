mod backend;
mod config;
mod http;
mod registry;
mod state;

use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use engine::{AuthorCache, ChangeHub, LikedCache, Services};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use backend::StoreBackend;
use config::Settings;
use http::router::build_router;
use registry::SessionRegistry;
use state::AppState;
use storage::Db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::new().context("Failed to load configuration")?;

    let db = Db::new(&settings.database.url).await?;
    let hub = ChangeHub::new(settings.realtime.buffer);

    let services = Services {
        backend: Arc::new(StoreBackend::new(db.clone(), hub)),
        local: Arc::new(db.clone()),
        authors: AuthorCache::new(settings.cache.author_capacity),
        liked: LikedCache::new(settings.cache.liked_capacity),
    };

    let shutdown = CancellationToken::new();
    let sessions = SessionRegistry::new(services, settings.session.clone(), shutdown.clone());
    sessions.spawn_sweeper();

    let state = AppState {
        db,
        sessions: sessions.clone(),
    };

    let app = build_router(state, &settings.server.cors_origins);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address: {}", addr))?;

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Closing {} open sessions", sessions.len().await);
            stop.cancel();
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
