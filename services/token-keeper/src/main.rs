//! Fxiaoke token keeper
//!
//! Single-binary service that:
//! 1. Loads app credentials from config, env vars and secret files
//! 2. Exchanges them for a corporate access token and caches it with its TTL
//! 3. Serves the token over HTTP, optionally probing the gateway first
//! 4. Exposes health and Prometheus metrics

mod config;
mod error;
mod metrics;
mod token_api;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use fxiaoke_auth::{AppCredential, FileTokenStore, HttpGateway, MemoryTokenStore, TokenStore};
use fxiaoke_token::TokenManager;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StoreBackend};

/// Drain timeout for graceful shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Request counters reported by `/health`
#[derive(Debug, Clone)]
struct ServiceStats {
    requests_total: Arc<AtomicU64>,
    errors_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl ServiceStats {
    fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    manager: Arc<TokenManager>,
    credential: Arc<AppCredential>,
    /// Parent of every per-request cancellation token
    shutdown: CancellationToken,
    store_backend: StoreBackend,
    stats: ServiceStats,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route(
            "/token",
            get(token_api::get_token).delete(token_api::delete_token),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting fxiaoke-token-keeper");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let credential = Arc::new(config.credential()?);

    info!(
        app_id = %credential.app_id,
        base_url = %config.gateway.base_url,
        store = config.store.backend.label(),
        listen_addr = %config.server.listen_addr,
        "configuration loaded"
    );

    let gateway = Arc::new(
        HttpGateway::new(&config.gateway_config()).context("failed to build gateway client")?,
    );

    let store: Arc<dyn TokenStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryTokenStore::new()),
        StoreBackend::File => {
            let path = config
                .store
                .path
                .clone()
                .context("store.path is required for the file backend")?;
            let store = FileTokenStore::load(path.clone())
                .await
                .with_context(|| format!("failed to open token store {}", path.display()))?;
            info!(path = %store.path().display(), "file token store ready");
            Arc::new(store)
        }
    };

    let manager = Arc::new(TokenManager::new(store, gateway, config.manager_config()));
    let shutdown = CancellationToken::new();

    // Warm the cache so the first caller doesn't pay for the exchange
    match manager.get_token(&credential, &shutdown).await {
        Ok(token) => info!(corp_id = %token.corp_id, "initial token ready"),
        Err(e) => warn!(error = %e, "initial token exchange failed, will retry on demand"),
    }

    let app_state = AppState {
        manager,
        credential,
        shutdown: shutdown.clone(),
        store_backend: config.store.backend,
        stats: ServiceStats::new(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);
    let listen_addr = config.server.listen_addr;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: notify the server to drain, then race it against the timer.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Abort in-flight backoff waits, then let the server drain
    shutdown.cancel();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: uptime and request counters.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "app_id": state.credential.app_id,
        "store": state.store_backend.label(),
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "errors_total": state.stats.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
