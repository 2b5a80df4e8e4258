//! Cached user identity, updated after login and after a token refresh
//!
//! The session coordinator receives a `SessionSink` at construction instead of
//! reaching for a global store. `UserSession` is the default sink: it keeps
//! the signed-in profile in memory and mirrors the role into the credential
//! store's `userRole` marker.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use billmate_auth::{
    ACCESS_TOKEN, ACCESS_TOKEN_EXPIRY_DAYS, CookieOptions, CredentialStore, REFRESH_TOKEN,
    REFRESH_TOKEN_EXPIRY_DAYS, TokenPair, USER_ROLE, UserProfile,
};
use tracing::{debug, warn};

use crate::error::Result;

/// Receiver of user-identity changes.
pub trait SessionSink: Send + Sync {
    /// The cached user, if signed in.
    fn current_user(&self) -> Option<UserProfile>;

    /// Replace the cached user profile (token pair unchanged).
    fn update_user<'a>(
        &'a self,
        user: UserProfile,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Record a full sign-in: profile plus token pair.
    fn set_auth<'a>(
        &'a self,
        user: UserProfile,
        tokens: TokenPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Forget the cached user.
    fn clear(&self);
}

/// In-memory user cache backed by the shared credential store.
pub struct UserSession {
    user: RwLock<Option<UserProfile>>,
    store: Arc<dyn CredentialStore>,
    secure: bool,
}

impl UserSession {
    /// `secure` marks every credential written by this sink as HTTPS-only.
    pub fn new(store: Arc<dyn CredentialStore>, secure: bool) -> Self {
        Self {
            user: RwLock::new(None),
            store,
            secure,
        }
    }

    fn replace(&self, user: Option<UserProfile>) {
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = user;
    }

    async fn write_role(&self, user: &UserProfile) -> Result<()> {
        self.store
            .set(
                USER_ROLE,
                user.role.as_str().to_string(),
                CookieOptions::lax(REFRESH_TOKEN_EXPIRY_DAYS, self.secure),
            )
            .await?;
        Ok(())
    }
}

impl SessionSink for UserSession {
    fn current_user(&self) -> Option<UserProfile> {
        self.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_user<'a>(
        &'a self,
        user: UserProfile,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(e) = self.write_role(&user).await {
                warn!(error = %e, "failed to persist role marker");
            }
            debug!(user_id = %user.id, "user profile updated");
            self.replace(Some(user));
        })
    }

    fn set_auth<'a>(
        &'a self,
        user: UserProfile,
        tokens: TokenPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.store
                .set(
                    ACCESS_TOKEN,
                    tokens.access_token,
                    CookieOptions::lax(ACCESS_TOKEN_EXPIRY_DAYS, self.secure),
                )
                .await?;
            self.store
                .set(
                    REFRESH_TOKEN,
                    tokens.refresh_token,
                    CookieOptions::lax(REFRESH_TOKEN_EXPIRY_DAYS, self.secure),
                )
                .await?;
            self.write_role(&user).await?;
            debug!(user_id = %user.id, role = user.role.as_str(), "session established");
            self.replace(Some(user));
            Ok(())
        })
    }

    fn clear(&self) {
        self.replace(None);
    }
}
