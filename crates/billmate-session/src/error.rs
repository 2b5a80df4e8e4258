//! Error types for authenticated requests

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

/// A complete backend response: status, headers and body.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidResponse(format!("decoding response body: {e}")))
    }

    /// Decode the backend's `{success, message, data}` envelope and return `data`.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        #[derive(serde::Deserialize)]
        struct Envelope<T> {
            data: Option<T>,
        }
        self.json::<Envelope<T>>()?
            .data
            .ok_or_else(|| Error::InvalidResponse("response has no data".into()))
    }

    /// Body as lossy UTF-8, for logs and error messages.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Errors surfaced to callers of `AuthenticatedHttpClient`.
///
/// `Clone` because a single refresh failure is delivered to every request
/// queued behind it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No response received (connection refused, reset, DNS).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The backend answered with a non-success status.
    #[error("backend returned status {}", .0.status)]
    Status(Box<ApiResponse>),

    /// Given to queued requests when the session has no refresh token.
    #[error("no refresh token")]
    NoRefreshToken,

    #[error("token refresh failed: {0}")]
    Refresh(String),

    /// The request that owned the refresh was dropped before it settled.
    #[error("token refresh abandoned before it settled")]
    RefreshAbandoned,

    /// Login refused (wrong email/password or deactivated account).
    #[error("sign-in rejected: {0}")]
    SignInRejected(String),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// HTTP status carried by the error, if the backend answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status(response) => Some(response.status),
            _ => None,
        }
    }
}

impl From<billmate_auth::Error> for Error {
    fn from(err: billmate_auth::Error) -> Self {
        match err {
            billmate_auth::Error::CredentialParse(msg) | billmate_auth::Error::Io(msg) => {
                Error::Credential(msg)
            }
            other => Error::Refresh(other.to_string()),
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
