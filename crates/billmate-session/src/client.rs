//! HTTP client that attaches the stored access token and recovers from 401s
//!
//! Every request reads the current access token from the credential store at
//! dispatch time. A 401 on the first attempt is handed to the session
//! coordinator, which supplies a fresh token (refreshing if needed), and the
//! request is replayed exactly once with it.

use std::sync::Arc;
use std::time::Duration;

use billmate_auth::{ACCESS_TOKEN, CredentialStore, LOGOUT_PATH, endpoint};
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::classify::{Attempt, Disposition, classify};
use crate::coordinator::SessionCoordinator;
use crate::error::{ApiResponse, Error, Result};

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path plus optional query, starting with `/` (for example `/customers?page=2`).
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| Error::InvalidRequest(format!("encoding JSON body: {e}")))?;
        Ok(self
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Authenticated access to the backend API. Cheap to clone.
#[derive(Clone)]
pub struct AuthenticatedHttpClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    session: Arc<SessionCoordinator>,
}

impl AuthenticatedHttpClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        session: Arc<SessionCoordinator>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            store,
            session,
        }
    }

    /// Send `request`, recovering from one authentication failure.
    ///
    /// Returns the response for 2xx/3xx. Any other status comes back as
    /// `Error::Status` with the full response; transport failures and
    /// timeouts are returned without retrying.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let token = self.store.get(ACCESS_TOKEN).await;
        let response = self.dispatch(&request, token.as_deref()).await?;

        match classify(response.status, Attempt::First) {
            Disposition::Deliver => Ok(response),
            Disposition::Reject => Err(Error::Status(Box::new(response))),
            Disposition::Recover => {
                debug!("request unauthorized, recovering session");
                let fresh = self
                    .session
                    .recover(token.as_deref(), Error::Status(Box::new(response)))
                    .await?;

                let replay = self.dispatch(&request, Some(&fresh)).await?;
                match classify(replay.status, Attempt::Replay) {
                    Disposition::Deliver => Ok(replay),
                    _ => {
                        debug!(status = replay.status, "replayed request failed");
                        Err(Error::Status(Box::new(replay)))
                    }
                }
            }
        }
    }

    /// Tell the backend to revoke the session, then clear local credentials.
    ///
    /// The backend call is best effort and never refreshes: an expired token
    /// is simply not revoked. Local credentials are cleared either way.
    pub async fn logout(&self) {
        if let Some(token) = self.store.get(ACCESS_TOKEN).await {
            match self.dispatch(&ApiRequest::post(LOGOUT_PATH), Some(&token)).await {
                Ok(response) if response.is_success() => debug!("backend session revoked"),
                Ok(response) => warn!(status = response.status, "backend logout rejected"),
                Err(e) => warn!(error = %e, "backend logout failed"),
            }
        }
        self.session.sign_out().await;
    }

    pub fn session(&self) -> &Arc<SessionCoordinator> {
        &self.session
    }

    /// One HTTP exchange with `token` as the bearer credential.
    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse> {
        if !request.path.starts_with('/') {
            return Err(Error::InvalidRequest(format!(
                "path must start with '/': {}",
                request.path
            )));
        }

        let mut headers = request.headers.clone();
        headers.remove(AUTHORIZATION);

        let mut builder = self
            .http
            .request(request.method.clone(), endpoint(&self.base_url, &request.path))
            .headers(headers);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(err.to_string())
    } else {
        Error::Transport(err.to_string())
    }
}
