//! Calls to the backend's `/auth` routes
//!
//! Every backend response is wrapped as `{success, message, data}`. These
//! helpers unwrap `data` and turn anything else into an `Error`:
//! - `refresh_token`: `POST /auth/refresh-token` with `{refreshToken}`
//! - `fetch_profile`: `GET /auth/profile` with a bearer token
//! - `login`: `POST /auth/login` with `{email, password}`

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{LOGIN_PATH, PROFILE_PATH, REFRESH_PATH};
use crate::error::{Error, Result};
use crate::profile::UserProfile;

/// Access/refresh token pair as issued by the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

/// `data` payload of a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: UserProfile,
    pub tokens: TokenPair,
}

/// Response envelope shared by all backend routes.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Join the API base URL and a route path.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Exchange a refresh token for a new token pair.
///
/// A 401/403 means the refresh token was revoked or has expired. A success
/// status without `data.accessToken` is a malformed response.
pub async fn refresh_token(
    client: &reqwest::Client,
    base_url: &str,
    refresh: &str,
) -> Result<TokenPair> {
    let response = client
        .post(endpoint(base_url, REFRESH_PATH))
        .json(&RefreshRequest {
            refresh_token: refresh,
        })
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let pair: TokenPair = read_data(response, "refresh").await?;
    if pair.access_token.is_empty() {
        return Err(Error::BadResponse("refresh response has an empty access token".into()));
    }
    debug!("token refresh response accepted");
    Ok(pair)
}

/// Load the profile of the user the access token belongs to.
pub async fn fetch_profile(
    client: &reqwest::Client,
    base_url: &str,
    access: &str,
) -> Result<UserProfile> {
    let response = client
        .get(endpoint(base_url, PROFILE_PATH))
        .bearer_auth(access)
        .send()
        .await
        .map_err(|e| Error::Http(format!("profile request failed: {e}")))?;

    read_data(response, "profile").await
}

/// Sign in with email and password.
pub async fn login(
    client: &reqwest::Client,
    base_url: &str,
    email: &str,
    password: &str,
) -> Result<LoginResponse> {
    let response = client
        .post(endpoint(base_url, LOGIN_PATH))
        .json(&LoginRequest { email, password })
        .send()
        .await
        .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

    read_data(response, "login").await
}

/// Check the status and unwrap `data` from the envelope.
async fn read_data<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
            .ok()
            .and_then(|e| e.message)
            .unwrap_or(body);

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "{what} rejected ({status}): {message}"
            )));
        }
        return Err(Error::BadResponse(format!("{what} returned {status}: {message}")));
    }

    let envelope = response
        .json::<Envelope<T>>()
        .await
        .map_err(|e| Error::BadResponse(format!("invalid {what} response: {e}")))?;

    envelope
        .data
        .ok_or_else(|| Error::BadResponse(format!("{what} response has no data")))
}
