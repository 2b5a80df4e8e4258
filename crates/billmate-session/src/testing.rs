//! Test support: a mock BillMate24 backend and a wired-up session harness
//!
//! The backend accepts exactly one access token (`T2`) on API routes. Its
//! refresh endpoint issues `T2`/`R2` (or fails, per `RefreshMode`) after an
//! optional delay, so tests can pile requests up behind an in-flight refresh.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use billmate_auth::{
    ACCESS_TOKEN, CookieOptions, CredentialStore, FileCredentialStore, REFRESH_TOKEN, Role,
    UserProfile,
};
use tokio::net::TcpListener;

use crate::client::AuthenticatedHttpClient;
use crate::coordinator::{SessionCoordinator, SessionOptions};
use crate::navigation::LocalNavigator;
use crate::sink::UserSession;

/// The only access token the mock backend accepts.
pub const VALID_TOKEN: &str = "T2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// `{data: {accessToken: "T2", refreshToken: "R2"}}`
    Issue,
    /// 401 `Invalid refresh token`
    Reject,
    /// 200 with a body missing the token pair
    Malformed,
}

pub struct Backend {
    refresh_mode: RefreshMode,
    refresh_delay: Duration,
    profile_delay: Duration,
    profile_ok: bool,
    refresh_calls: AtomicUsize,
    profile_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    /// (path, bearer) for every API request, in arrival order
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl Backend {
    pub fn new() -> Self {
        Self {
            refresh_mode: RefreshMode::Issue,
            refresh_delay: Duration::ZERO,
            profile_delay: Duration::ZERO,
            profile_ok: true,
            refresh_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn refresh_mode(mut self, mode: RefreshMode) -> Self {
        self.refresh_mode = mode;
        self
    }

    pub fn refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn profile_delay(mut self, delay: Duration) -> Self {
        self.profile_delay = delay;
        self
    }

    pub fn failing_profile(mut self) -> Self {
        self.profile_ok = false;
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Bearer tokens seen on `path`, in arrival order.
    pub fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Serve on an ephemeral port; returns the API base URL.
    pub async fn serve(self: Arc<Self>) -> String {
        let router = axum::Router::new()
            .route("/api/auth/refresh-token", post(refresh_handler))
            .route("/api/auth/profile", get(profile_handler))
            .route("/api/auth/login", post(login_handler))
            .route("/api/auth/logout", post(logout_handler))
            .fallback(api_handler)
            .with_state(self);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/api")
    }
}

pub fn profile(id: &str) -> UserProfile {
    serde_json::from_value(serde_json::json!({
        "_id": id,
        "email": "shop@example.com",
        "name": "Asha Traders",
        "role": Role::Shopkeeper,
    }))
    .unwrap()
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"success": false, "message": "Invalid or expired token"})),
    )
        .into_response()
}

async fn refresh_handler(State(backend): State<Arc<Backend>>) -> Response {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(backend.refresh_delay).await;
    match backend.refresh_mode {
        RefreshMode::Issue => Json(serde_json::json!({
            "success": true,
            "message": "Tokens refreshed successfully",
            "data": {"accessToken": VALID_TOKEN, "refreshToken": "R2"}
        }))
        .into_response(),
        RefreshMode::Reject => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"success": false, "message": "Invalid refresh token"})),
        )
            .into_response(),
        RefreshMode::Malformed => {
            Json(serde_json::json!({"success": true, "data": {}})).into_response()
        }
    }
}

async fn profile_handler(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    backend.profile_calls.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(backend.profile_delay).await;
    if !backend.profile_ok {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if bearer(&headers).as_deref() != Some(VALID_TOKEN) {
        return unauthorized();
    }
    Json(serde_json::json!({"success": true, "data": profile("u1")})).into_response()
}

async fn login_handler(Json(body): Json<serde_json::Value>) -> Response {
    if body["password"] != "secret" {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"success": false, "message": "Invalid email or password"})),
        )
            .into_response();
    }
    Json(serde_json::json!({
        "success": true,
        "message": "Login successful",
        "data": {
            "user": profile("u1"),
            "tokens": {"accessToken": VALID_TOKEN, "refreshToken": "R2"}
        }
    }))
    .into_response()
}

async fn logout_handler(State(backend): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    if bearer(&headers).as_deref() != Some(VALID_TOKEN) {
        return unauthorized();
    }
    backend.logout_calls.fetch_add(1, Ordering::SeqCst);
    Json(serde_json::json!({"success": true, "message": "Logout successful", "data": null}))
        .into_response()
}

/// Every other route. `/api/always-401/...` rejects any token, `/api/boom` is
/// a server error, everything else echoes the path and bearer when authorized.
async fn api_handler(
    State(backend): State<Arc<Backend>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().to_string();
    let token = bearer(&headers);
    backend
        .seen
        .lock()
        .unwrap()
        .push((path.clone(), token.clone()));

    match path.as_str() {
        "/api/boom" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"success": false, "message": "Internal server error"})),
        )
            .into_response(),
        p if p.starts_with("/api/always-401") => unauthorized(),
        _ if token.as_deref() == Some(VALID_TOKEN) => Json(serde_json::json!({
            "success": true,
            "data": {"path": path, "bearer": token, "query": uri.query()}
        }))
        .into_response(),
        _ => unauthorized(),
    }
}

/// A fresh credential store in a temp directory.
pub async fn temp_store() -> (tempfile::TempDir, Arc<FileCredentialStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileCredentialStore::load(dir.path().join("credentials.json"))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

/// Mock backend plus a client wired to it.
pub struct Harness {
    pub backend: Arc<Backend>,
    pub base_url: String,
    pub store: Arc<FileCredentialStore>,
    pub sink: Arc<UserSession>,
    pub navigator: Arc<LocalNavigator>,
    pub session: Arc<SessionCoordinator>,
    pub client: AuthenticatedHttpClient,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// Start `backend` and seed the store with the given tokens.
    pub async fn start(backend: Backend, access: Option<&str>, refresh: Option<&str>) -> Self {
        let backend = Arc::new(backend);
        let base_url = backend.clone().serve().await;
        let (dir, store) = temp_store().await;

        if let Some(access) = access {
            store
                .set(ACCESS_TOKEN, access.to_string(), CookieOptions::lax(7, false))
                .await
                .unwrap();
        }
        if let Some(refresh) = refresh {
            store
                .set(REFRESH_TOKEN, refresh.to_string(), CookieOptions::lax(30, false))
                .await
                .unwrap();
        }

        let http = reqwest::Client::new();
        let sink = Arc::new(UserSession::new(store.clone(), false));
        let navigator = Arc::new(LocalNavigator::new("/dashboard"));
        let session = Arc::new(SessionCoordinator::new(
            http.clone(),
            base_url.clone(),
            store.clone(),
            sink.clone(),
            navigator.clone(),
            SessionOptions::default(),
        ));
        let client =
            AuthenticatedHttpClient::new(http, base_url.clone(), store.clone(), session.clone());

        Self {
            backend,
            base_url,
            store,
            sink,
            navigator,
            session,
            client,
            _dir: dir,
        }
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
