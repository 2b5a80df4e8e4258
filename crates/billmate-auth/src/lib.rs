//! BillMate24 authentication primitives
//!
//! Everything the session layer needs to talk to the backend's `/auth` routes
//! and to keep credentials across restarts:
//!
//! 1. `credentials::FileCredentialStore` persists `accessToken`, `refreshToken`
//!    and the `userRole` marker with cookie-style options and expiry
//! 2. `token::login()` exchanges email/password for a token pair and profile
//! 3. `token::refresh_token()` exchanges a refresh token for a new pair
//! 4. `token::fetch_profile()` loads the signed-in user's profile
//!
//! The single-flight refresh coordination lives in `billmate-session`; this
//! crate only performs the individual calls.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod profile;
pub mod token;

pub use constants::*;
pub use credentials::{
    CookieOptions, CredentialStore, FileCredentialStore, SameSite, StoredCredential,
};
pub use error::{Error, Result};
pub use profile::{Features, Role, UserProfile};
pub use token::{LoginResponse, TokenPair, endpoint, fetch_profile, login, refresh_token};
