//! Catalog Gateway
//!
//! Single-binary Rust service in front of the catalog application that:
//! 1. Keeps a cookie-backed session per browser, refreshing it before expiry
//! 2. Sends anonymous visitors of protected paths to the magic-link login
//! 3. Completes sign-in on the callback route (code, fragment tokens or error)
//! 4. Forwards everything else to the catalog with the signed-in subject attached

mod auth;
mod config;
mod error;
mod forward;
mod metrics;
mod pages;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Extension, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use identity::HostedProvider;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::auth::{AuthState, CurrentSession};
use crate::config::Config;
use crate::forward::ForwardState;

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-wide request counters for `/health`
#[derive(Clone)]
struct RequestStats {
    started_at: Instant,
    requests_total: Arc<AtomicU64>,
    in_flight: Arc<AtomicU64>,
}

impl RequestStats {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Decrements the in-flight gauge when the request finishes, however it finishes.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    auth: AuthState,
    forward: ForwardState,
    stats: RequestStats,
    prometheus: PrometheusHandle,
}

/// Wire the provider client and the auth layer from validated config.
fn build_state(config: &Config, prometheus: PrometheusHandle) -> error::Result<AppState> {
    let anon_key = config.identity.anon_key.clone().ok_or_else(|| {
        common::Error::Config("identity anon key missing after config load".into())
    })?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.identity.timeout_secs))
        .build()?;
    let provider = HostedProvider::new(&config.identity.url, anon_key)?.with_http_client(http);
    let auth = AuthState::from_config(config, Arc::new(provider))?;

    Ok(AppState {
        auth,
        forward: ForwardState::new(
            &config.catalog.upstream_url,
            Duration::from_secs(config.catalog.timeout_secs),
        ),
        stats: RequestStats::new(),
        prometheus,
    })
}

/// Build the axum router with all routes and shared state.
///
/// `/health` and `/metrics` bypass the session guard; everything else,
/// including the forwarding fallback, goes through it.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let auth_routes = &state.auth.routes;
    let guarded = Router::new()
        .route(
            auth_routes.login_path(),
            get(routes::login_page).post(routes::request_magic_link),
        )
        .route(
            auth_routes.callback_path(),
            get(routes::callback_get).post(routes::callback_post),
        )
        .route("/logout", get(routes::logout).post(routes::logout))
        .route("/session", get(routes::session_info))
        .fallback(forward_handler)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::guard_requests,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(guarded)
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
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

    info!("starting catalog-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

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

    info!(
        listen_addr = %config.server.listen_addr,
        origin = %config.site.origin(),
        upstream_url = %config.catalog.upstream_url,
        identity_url = %config.identity.url,
        protected = ?config.routes.protected,
        "configuration loaded"
    );

    let app_state =
        build_state(&config, prometheus_handle).context("failed to initialize auth layer")?;
    let in_flight = app_state.stats.in_flight.clone();
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
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Count, time and label every request, guarded or not.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let started = Instant::now();
    state.stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.stats.in_flight);

    let response = next.run(request).await;
    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Health endpoint: status, uptime and request counters as JSON.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.stats.started_at.elapsed().as_secs(),
        "requests_served": state.stats.requests_total.load(Ordering::Relaxed),
        "in_flight": state.stats.in_flight.load(Ordering::Relaxed),
    });
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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

/// Catch-all: forward to the catalog as the subject the guard resolved.
async fn forward_handler(
    State(state): State<AppState>,
    Extension(CurrentSession(session)): Extension<CurrentSession>,
    request: Request,
) -> Response {
    forward::forward_request(
        &state.forward,
        request,
        session.as_ref(),
        forward::new_request_id(),
    )
    .await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
