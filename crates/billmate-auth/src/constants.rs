//! Backend routes, credential names and cookie lifetimes
//!
//! Paths are relative to the API base URL (for example
//! `http://localhost:5000/api`), which already carries the `/api` prefix.

/// Default API base URL when none is configured.
pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Refresh-token exchange route
pub const REFRESH_PATH: &str = "/auth/refresh-token";

/// Current user profile route (bearer protected)
pub const PROFILE_PATH: &str = "/auth/profile";

/// Email/password login route
pub const LOGIN_PATH: &str = "/auth/login";

/// Server-side logout route (bearer protected)
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Credential store name for the access token
pub const ACCESS_TOKEN: &str = "accessToken";

/// Credential store name for the refresh token
pub const REFRESH_TOKEN: &str = "refreshToken";

/// Credential store name for the cached role marker
pub const USER_ROLE: &str = "userRole";

/// Path every session credential is scoped to.
pub const COOKIE_PATH: &str = "/";

/// The access token cookie outlives the token itself; refresh handles expiry.
pub const ACCESS_TOKEN_EXPIRY_DAYS: u32 = 7;

pub const REFRESH_TOKEN_EXPIRY_DAYS: u32 = 30;

/// Navigation target after an unrecoverable auth failure.
pub const SIGN_IN_PATH: &str = "/login";
