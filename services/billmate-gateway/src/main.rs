//! BillMate24 session gateway
//!
//! Single-binary Rust service that:
//! 1. Holds the BillMate24 session (access/refresh tokens) in a credential file
//! 2. Listens for incoming API requests
//! 3. Forwards them to the backend with the current access token
//! 4. Refreshes the token pair once when the backend reports it expired,
//!    replaying every request that failed meanwhile

mod config;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use billmate_auth::{CookieOptions, CredentialStore, FileCredentialStore, REFRESH_TOKEN};
use billmate_auth::{REFRESH_TOKEN_EXPIRY_DAYS, UserProfile};
use billmate_session::{
    AuthenticatedHttpClient, Error as SessionError, LocalNavigator, Navigator, SessionCoordinator,
    SessionOptions, UserSession,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::proxy::{ProxyState, error_response};

/// How long in-flight requests may run after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Location reported after a successful sign-in.
const HOME_PATH: &str = "/dashboard";
const ADMIN_HOME_PATH: &str = "/admin";

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    store: Arc<dyn CredentialStore>,
    navigator: Arc<LocalNavigator>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn session(&self) -> &Arc<SessionCoordinator> {
        self.proxy.client.session()
    }
}

/// Wire the session stack around an opened credential store.
async fn build_state(
    http: reqwest::Client,
    api_base_url: &str,
    store: Arc<FileCredentialStore>,
    options: SessionOptions,
    timeout: Duration,
    prometheus: PrometheusHandle,
) -> AppState {
    let signed_in = store.get(REFRESH_TOKEN).await.is_some();
    let location = if signed_in {
        HOME_PATH
    } else {
        options.sign_in_path.as_str()
    };
    let navigator = Arc::new(LocalNavigator::new(location));
    let sink = Arc::new(UserSession::new(store.clone(), options.secure_cookies));
    let sign_in_path = options.sign_in_path.clone();

    let session = Arc::new(SessionCoordinator::new(
        http.clone(),
        api_base_url,
        store.clone(),
        sink,
        navigator.clone(),
        options,
    ));
    let client = AuthenticatedHttpClient::new(http, api_base_url, store.clone(), session);

    AppState {
        proxy: ProxyState {
            client,
            timeout,
            sign_in_path,
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
        },
        store,
        navigator,
        started_at: Instant::now(),
        prometheus,
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/session/login", post(login_handler))
        .route("/session/logout", post(logout_handler))
        .fallback(proxy_handler)
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

    info!("starting billmate-gateway");

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

    info!(
        listen_addr = %config.gateway.listen_addr,
        api_base_url = %config.gateway.api_base_url,
        credentials = %config.session.credentials_path.display(),
        "configuration loaded"
    );

    let store = FileCredentialStore::load(config.session.credentials_path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open credential store {}",
                config.session.credentials_path.display()
            )
        })?;

    if let Some(seed) = &config.session.refresh_token
        && store.get(REFRESH_TOKEN).await.is_none()
    {
        store
            .set(
                REFRESH_TOKEN,
                seed.expose().clone(),
                CookieOptions::lax(REFRESH_TOKEN_EXPIRY_DAYS, config.session.secure_cookies),
            )
            .await
            .context("failed to seed refresh token")?;
        info!("seeded refresh token from configuration");
    }

    let timeout = Duration::from_secs(config.gateway.timeout_secs);
    let http = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")?;

    let options = SessionOptions {
        sign_in_path: config.session.sign_in_path.clone(),
        rehydrate_profile: config.session.rehydrate_profile,
        secure_cookies: config.session.secure_cookies,
    };
    let state = build_state(
        http,
        &config.gateway.api_base_url,
        Arc::new(store),
        options,
        timeout,
        prometheus_handle,
    )
    .await;
    let requests_served = state.proxy.requests_total.clone();
    let app = build_router(state, config.gateway.max_connections);

    let listen_addr = config.gateway.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires
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
            warn!(
                requests_served = requests_served.load(Ordering::Relaxed),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while a refresh token is stored, 503 once signed out.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let requests = state.proxy.requests_total.load(Ordering::Relaxed);
    let errors = state.proxy.errors_total.load(Ordering::Relaxed);
    let signed_in = state.store.get(REFRESH_TOKEN).await.is_some();

    let (status_code, status, session) = if signed_in {
        (StatusCode::OK, "healthy", "active")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "signed_out", "none")
    };
    let body = serde_json::json!({
        "status": status,
        "session": session,
        "location": state.navigator.current_location(),
        "redirect_pending": state.session().redirect_pending(),
        "uptime_seconds": uptime,
        "requests_served": requests,
        "errors_total": errors,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// Sign in with email and password and record the new session.
async fn login_handler(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Response {
    let request_id = new_request_id();
    match state.session().sign_in(&body.email, &body.password).await {
        Ok(user) => {
            state.navigator.visit(home_for(&user));
            (StatusCode::OK, Json(serde_json::json!({ "user": user }))).into_response()
        }
        Err(SessionError::SignInRejected(message)) => {
            warn!(error = %message, "sign-in rejected");
            error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                &message,
                &request_id,
                None,
            )
        }
        Err(e) => {
            error!(error = %e, "sign-in failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &e.to_string(),
                &request_id,
                None,
            )
        }
    }
}

/// Revoke the session on the backend and clear local credentials.
async fn logout_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.proxy.client.logout().await;
    state.navigator.visit(state.proxy.sign_in_path.clone());
    Json(serde_json::json!({ "status": "signed_out" }))
}

/// Catch-all handler that forwards every other request to the backend.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::proxy_request(&state.proxy, request, new_request_id()).await
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn home_for(user: &UserProfile) -> &'static str {
    if user.is_admin() {
        ADMIN_HOME_PATH
    } else {
        HOME_PATH
    }
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
