//! HTTP forwarding through the authenticated client
//!
//! Receives inbound requests, strips hop-by-hop and credential headers, and
//! sends them to the backend through `AuthenticatedHttpClient`, which attaches
//! the stored access token and recovers from expired tokens. Backend
//! responses are returned verbatim whatever their status.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use billmate_session::{ApiRequest, ApiResponse, AuthenticatedHttpClient, Error, error_type};
use tracing::{error, instrument, warn};

/// Largest request body accepted for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers the gateway owns: the client sets `host` and
/// `content-length`, the session supplies `authorization`.
const GATEWAY_OWNED_HEADERS: &[&str] = &["host", "content-length", "authorization"];

/// Shared state for the forwarding handler
#[derive(Clone)]
pub struct ProxyState {
    pub client: AuthenticatedHttpClient,
    pub timeout: Duration,
    pub sign_in_path: String,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// JSON error body: `{"error":{"type","message","request_id"}}`, plus
/// `redirect` when the caller must sign in again.
pub fn error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
    request_id: &str,
    redirect: Option<&str>,
) -> Response {
    let mut error = serde_json::json!({
        "type": kind,
        "message": message,
        "request_id": request_id,
    });
    if let Some(location) = redirect {
        error["redirect"] = serde_json::Value::String(location.to_string());
    }
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": error }).to_string(),
    )
        .into_response()
}

/// Forward an inbound request to the backend API.
#[instrument(
    skip_all,
    fields(request_id = %request_id, method = %request.method(), path = %request.uri().path())
)]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let method = request.method().clone();

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_gateway_owned(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            let response = error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                &request_id,
                None,
            );
            crate::metrics::record_request(400, method.as_str(), started.elapsed().as_secs_f64());
            return response;
        }
    };

    let mut api_request = ApiRequest::new(method.clone(), path).timeout(state.timeout);
    api_request.headers = headers;
    if !body.is_empty() {
        api_request = api_request.body(body);
    }

    let response = match state.client.send(api_request).await {
        Ok(response) => backend_response(response, &request_id),
        // Non-success statuses are the backend's answer; pass them through
        Err(Error::Status(response)) => backend_response(*response, &request_id),
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_upstream_error(error_type(&e));
            failure_response(&e, state, &request_id)
        }
    };

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Rebuild a backend response for the inbound client.
fn backend_response(response: ApiResponse, request_id: &str) -> Response {
    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if !is_hop_by_hop(name.as_str()) && *name != header::CONTENT_LENGTH {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "gateway_error",
            &format!("response build error: {e}"),
            request_id,
            None,
        )
    })
}

/// Map a request that produced no backend answer to a gateway error.
fn failure_response(err: &Error, state: &ProxyState, request_id: &str) -> Response {
    match err {
        Error::Timeout(_) => {
            warn!(error = %err, "backend timeout");
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                &format!("backend timeout after {}s", state.timeout.as_secs_f64()),
                request_id,
                None,
            )
        }
        Error::Transport(_) | Error::InvalidResponse(_) => {
            error!(error = %err, "backend request failed");
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                &err.to_string(),
                request_id,
                None,
            )
        }
        Error::NoRefreshToken | Error::Refresh(_) => {
            warn!(error = %err, "session ended");
            error_response(
                StatusCode::UNAUTHORIZED,
                "session_expired",
                "session expired, sign in again",
                request_id,
                Some(&state.sign_in_path),
            )
        }
        Error::RefreshAbandoned => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "refresh_abandoned",
            &err.to_string(),
            request_id,
            None,
        ),
        Error::InvalidRequest(_) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            &err.to_string(),
            request_id,
            None,
        ),
        Error::Credential(_) | Error::SignInRejected(_) | Error::Status(_) => {
            error!(error = %err, "gateway failure");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "gateway_error",
                &err.to_string(),
                request_id,
                None,
            )
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_gateway_owned(name: &str) -> bool {
    GATEWAY_OWNED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
