//! Periscope - remote browser-streaming gateway
//!
//! Owns a headless browser per connected client, streams screencast frames
//! over WebSocket, and forwards input in the other direction.

mod browser;
mod config;
mod fabric;
mod gateway;
mod memory;
mod pump;
mod router;
mod session;
mod wire;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use browser::BrowserDriver;
use config::Config;
use fabric::CircuitBreaker;
use gateway::{AcceptNonEmpty, AppState};
use memory::{MemoryGovernor, QualityDegrader};
use router::MessageRouter;
use session::SessionManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "periscope=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // A panicking task must not take the process down with it; every other
    // client keeps streaming.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "task panicked");
    }));

    let config = Arc::new(Config::from_env());

    let driver = BrowserDriver::new(config.browser.clone());
    let sessions = SessionManager::new(driver, Arc::clone(&config));
    sessions.start_sweeper();

    let governor = MemoryGovernor::new(config.memory.clone());
    let degrader: Arc<dyn QualityDegrader> = Arc::clone(&sessions) as Arc<dyn QualityDegrader>;
    governor.start(Arc::downgrade(&degrader));

    let router = Arc::new(MessageRouter::new(
        Arc::clone(&sessions),
        Arc::clone(&config),
    ));
    let create_breaker = Arc::new(CircuitBreaker::new(
        config.circuit.threshold,
        config.circuit.reset_timeout,
    ));

    let shutdown = CancellationToken::new();
    let state = AppState {
        config: Arc::clone(&config),
        sessions: Arc::clone(&sessions),
        governor: Arc::clone(&governor),
        router,
        create_breaker,
        authenticator: Arc::new(AcceptNonEmpty),
        active: Arc::new(StdMutex::new(HashSet::new())),
        started_at: Instant::now(),
        shutdown: shutdown.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = gateway::create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("periscope gateway listening on {}", addr);

    // Bind failure is an unrecoverable init error: non-zero exit.
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    // Stopped accepting; tear everything down before exiting 0.
    sessions.cleanup_all().await;
    governor.shutdown();
    tracing::info!("shutdown complete");

    Ok(())
}

/// Resolve on SIGINT or SIGTERM and cancel the shared token so open
/// connections drain.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
    token.cancel();
}
