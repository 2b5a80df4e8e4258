//! Authenticated HTTP access to the BillMate24 backend
//!
//! Callers send requests through `AuthenticatedHttpClient` and get a response
//! or an error; token expiry is handled underneath:
//!
//! 1. Each request carries the stored access token as a bearer credential
//! 2. A 401 on a first attempt hands the request to the `SessionCoordinator`
//! 3. The first such request refreshes the token pair; requests failing while
//!    that refresh is in flight queue behind it instead of refreshing again
//! 4. When the refresh settles, queued requests get the new token in FIFO
//!    order and replay once; a second 401 is returned as-is
//! 5. No refresh token, or a failed refresh, ends the session: credentials
//!    are cleared and the navigator is sent to sign-in exactly once

pub mod classify;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod navigation;
pub mod sink;

#[cfg(test)]
mod testing;

pub use classify::{Attempt, Disposition, classify, error_type};
pub use client::{ApiRequest, AuthenticatedHttpClient};
pub use coordinator::{Phase, SessionCoordinator, SessionOptions};
pub use error::{ApiResponse, Error, Result};
pub use navigation::{LocalNavigator, Navigator};
pub use sink::{SessionSink, UserSession};
