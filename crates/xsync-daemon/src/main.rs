//! `xsync-daemon` entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! `Engine`/`AppState`, wires middleware, starts the scheduler loop, and
//! serves HTTP. All route handlers live in `routes.rs`; all shared state
//! types live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use xsync_daemon::{routes, state};
use xsync_runtime::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let engine = Arc::new(Engine::from_env().await.context("building engine")?);
    let shared = Arc::new(state::AppState::new(Arc::clone(&engine)));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poll_interval = shared.engine.config.poll_interval;
    state::spawn_scheduler_loop(Arc::clone(&shared), poll_interval, shutdown_rx);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("xsync-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown_tx))
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("XSYNC_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins (the operator console runs locally;
/// the excluded end-user web UI is a separate deployment entirely).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

/// §5: on SIGINT/SIGTERM, flip the scheduler's shutdown watch so the
/// in-flight pass finishes its current batch, then let axum drain
/// in-flight HTTP requests before the process exits.
async fn wait_for_shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight run and requests");
    let _ = shutdown_tx.send(true);
}
