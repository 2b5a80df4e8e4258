//! Response classification for the retry decision
//!
//! Only a 401 can be recovered, and only once per request. Everything else is
//! handed back to the caller untouched: this layer never retries transport
//! errors or other failure statuses.

use crate::error::Error;

/// Which attempt of a request produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Original dispatch with whatever token was stored.
    First,
    /// Replay after the session coordinator supplied a new token.
    Replay,
}

/// What the client does with a completed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return the response to the caller.
    Deliver,
    /// Start or join a token refresh, then replay.
    Recover,
    /// Return the response to the caller as `Error::Status`.
    Reject,
}

/// HTTP status signalling an expired or invalid access token.
pub const AUTH_FAILURE_STATUS: u16 = 401;

/// Classify a response status for the given attempt.
pub fn classify(status: u16, attempt: Attempt) -> Disposition {
    match (status, attempt) {
        (200..=399, _) => Disposition::Deliver,
        (AUTH_FAILURE_STATUS, Attempt::First) => Disposition::Recover,
        _ => Disposition::Reject,
    }
}

/// Short label for metrics and logs.
pub fn error_type(err: &Error) -> &'static str {
    match err {
        Error::Transport(_) => "transport",
        Error::Timeout(_) => "timeout",
        Error::Status(response) if response.status == AUTH_FAILURE_STATUS => "unauthorized",
        Error::Status(_) => "status",
        Error::NoRefreshToken | Error::Refresh(_) | Error::RefreshAbandoned => "session",
        Error::SignInRejected(_) => "sign_in",
        Error::Credential(_) => "credential",
        Error::InvalidRequest(_) | Error::InvalidResponse(_) => "invalid",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiResponse;

    #[test]
    fn success_and_redirects_are_delivered() {
        for status in [200, 201, 204, 304] {
            assert_eq!(classify(status, Attempt::First), Disposition::Deliver);
            assert_eq!(classify(status, Attempt::Replay), Disposition::Deliver);
        }
    }

    #[test]
    fn first_401_is_recoverable() {
        assert_eq!(classify(401, Attempt::First), Disposition::Recover);
    }

    #[test]
    fn replayed_401_is_rejected() {
        assert_eq!(classify(401, Attempt::Replay), Disposition::Reject);
    }

    #[test]
    fn other_failures_are_rejected_without_recovery() {
        for status in [400, 403, 404, 409, 429, 500, 502, 503] {
            assert_eq!(classify(status, Attempt::First), Disposition::Reject, "status {status}");
        }
    }

    #[test]
    fn error_type_labels() {
        let unauthorized = Error::Status(Box::new(ApiResponse {
            status: 401,
            headers: Default::default(),
            body: Default::default(),
        }));
        assert_eq!(error_type(&unauthorized), "unauthorized");
        assert_eq!(error_type(&Error::Transport("refused".into())), "transport");
        assert_eq!(error_type(&Error::NoRefreshToken), "session");
        assert_eq!(error_type(&Error::Refresh("401".into())), "session");
    }
}
