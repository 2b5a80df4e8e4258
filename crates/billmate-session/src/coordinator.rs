//! Single-flight token refresh and session termination
//!
//! The coordinator owns the process-wide refresh state:
//!
//! - `Idle`: no refresh in flight
//! - `Refreshing`: one refresh call outstanding; requests that fail
//!   authentication meanwhile wait in a FIFO queue of one-shot senders
//!
//! The request that moves the state to `Refreshing` performs the refresh and
//! settles every queued sender before the state returns to `Idle`. Draining and
//! resetting happen under the same lock, so a request arriving mid-settlement
//! either lands in the queue being drained or sees `Idle` with the new token
//! already stored.
//!
//! When a session cannot be recovered (no refresh token, refresh rejected or
//! malformed) the coordinator clears the stored credentials and sends the
//! navigator to sign-in. The redirect guard makes that navigation happen once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use billmate_auth::{
    ACCESS_TOKEN, ACCESS_TOKEN_EXPIRY_DAYS, COOKIE_PATH, CookieOptions, CredentialStore,
    REFRESH_TOKEN, REFRESH_TOKEN_EXPIRY_DAYS, SIGN_IN_PATH, TokenPair, USER_ROLE,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::navigation::Navigator;
use crate::sink::SessionSink;

type Waiter = oneshot::Sender<Result<String>>;

enum RefreshState {
    Idle,
    Refreshing { waiters: VecDeque<Waiter> },
}

/// Observable refresh phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Refreshing { queued: usize },
}

/// Coordinator behaviour switches.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Location the navigator is sent to when the session ends.
    pub sign_in_path: String,
    /// Load `/auth/profile` after a successful refresh.
    pub rehydrate_profile: bool,
    /// Mark stored credentials HTTPS-only.
    pub secure_cookies: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sign_in_path: SIGN_IN_PATH.to_string(),
            rehydrate_profile: true,
            secure_cookies: false,
        }
    }
}

/// Owner of the refresh state, the pending queue and the redirect guard.
pub struct SessionCoordinator {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    sink: Arc<dyn SessionSink>,
    navigator: Arc<dyn Navigator>,
    options: SessionOptions,
    state: Mutex<RefreshState>,
    /// Bumped under the state lock each time a refresh settles.
    generation: AtomicU64,
    /// Bumped each time local credentials are cleared.
    epoch: AtomicU64,
    redirecting: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        store: Arc<dyn CredentialStore>,
        sink: Arc<dyn SessionSink>,
        navigator: Arc<dyn Navigator>,
        options: SessionOptions,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            store,
            sink,
            navigator,
            options,
            state: Mutex::new(RefreshState::Idle),
            generation: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            redirecting: AtomicBool::new(false),
        }
    }

    /// Obtain a usable access token after a request failed with 401.
    ///
    /// `sent_with` is the token the failed request carried; `original` is the
    /// error it produced. If the store already holds a different token (a
    /// refresh finished after the request went out) that token is returned
    /// without another refresh. Otherwise this call either performs the refresh
    /// or waits for the one in flight.
    ///
    /// With no refresh token stored, the performing caller gets `original`
    /// back and queued callers get `Error::NoRefreshToken`.
    pub async fn recover(&self, sent_with: Option<&str>, original: Error) -> Result<String> {
        let waiting = loop {
            let generation = self.generation.load(Ordering::Acquire);
            let current = self.store.get(ACCESS_TOKEN).await;

            let mut state = self.lock_state();
            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    debug!(queued = waiters.len(), "refresh in flight, queuing request");
                    break Some(rx);
                }
                RefreshState::Idle => {
                    // A refresh settled after `current` was read
                    if self.generation.load(Ordering::Acquire) != generation {
                        continue;
                    }
                    if let Some(token) = current.filter(|t| Some(t.as_str()) != sent_with) {
                        debug!("access token already replaced, replaying without refresh");
                        return Ok(token);
                    }
                    *state = RefreshState::Refreshing {
                        waiters: VecDeque::new(),
                    };
                    break None;
                }
            }
        };

        match waiting {
            Some(rx) => rx.await.unwrap_or(Err(Error::RefreshAbandoned)),
            None => self.lead_refresh(original).await,
        }
    }

    /// Current refresh phase.
    pub fn phase(&self) -> Phase {
        match &*self.lock_state() {
            RefreshState::Idle => Phase::Idle,
            RefreshState::Refreshing { waiters } => Phase::Refreshing {
                queued: waiters.len(),
            },
        }
    }

    /// Whether a sign-in navigation has been performed in this context.
    pub fn redirect_pending(&self) -> bool {
        self.redirecting.load(Ordering::Acquire)
    }

    /// Start a fresh navigation context: the next unrecoverable failure
    /// navigates to sign-in again. Called after a completed sign-in.
    pub fn begin_navigation_context(&self) {
        self.redirecting.store(false, Ordering::Release);
    }

    /// The identity sink this coordinator updates.
    pub fn sink(&self) -> &Arc<dyn SessionSink> {
        &self.sink
    }

    /// Terminate the session after an unrecoverable auth failure.
    ///
    /// Always clears the stored credentials and the cached user. Navigation
    /// happens at most once per navigation context, and not at all when the
    /// navigator is already at the sign-in location.
    pub async fn end_session(&self) {
        self.clear_credentials().await;
        metrics::counter!("session_sign_out_total").increment(1);

        let sign_in = self.options.sign_in_path.as_str();
        if self.navigator.current_location() == sign_in {
            debug!("already at sign-in location, not redirecting");
            return;
        }
        if self.redirecting.swap(true, Ordering::AcqRel) {
            debug!("redirect already in progress");
            return;
        }
        info!(location = sign_in, "session expired, redirecting to sign-in");
        self.navigator.navigate_to_sign_in(sign_in);
    }

    /// Sign in with email and password and record the new session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<billmate_auth::UserProfile> {
        let response = billmate_auth::login(&self.http, &self.base_url, email, password)
            .await
            .map_err(|e| match e {
                billmate_auth::Error::Http(msg) => Error::Transport(msg),
                billmate_auth::Error::InvalidCredentials(msg) => Error::SignInRejected(msg),
                other => Error::InvalidResponse(other.to_string()),
            })?;
        let user = response.user.clone();
        self.sink.set_auth(response.user, response.tokens).await?;
        self.begin_navigation_context();
        info!(user_id = %user.id, role = user.role.as_str(), "signed in");
        Ok(user)
    }

    /// User-initiated sign-out: clear credentials without navigating.
    pub async fn sign_out(&self) {
        self.clear_credentials().await;
        info!("signed out");
    }

    /// Perform the refresh as the single in-flight owner.
    async fn lead_refresh(&self, original: Error) -> Result<String> {
        let flight = Flight::new(self);
        let epoch = self.epoch.load(Ordering::Acquire);

        let Some(refresh) = self
            .store
            .get(REFRESH_TOKEN)
            .await
            .filter(|t| !t.is_empty())
        else {
            warn!("no refresh token stored, ending session");
            metrics::counter!("session_token_refresh_total", "outcome" => "no_refresh_token")
                .increment(1);
            flight.reject(Error::NoRefreshToken);
            self.end_session().await;
            flight.complete(Err(Error::NoRefreshToken));
            return Err(original);
        };

        info!("access token rejected, refreshing");
        match billmate_auth::refresh_token(&self.http, &self.base_url, &refresh).await {
            Ok(pair) => {
                self.persist(&pair).await;
                if self.epoch.load(Ordering::Acquire) != epoch {
                    // Signed out while the refresh was in flight; drop the new pair
                    info!("session cleared during token refresh, discarding new tokens");
                    metrics::counter!("session_token_refresh_total", "outcome" => "signed_out")
                        .increment(1);
                    self.discard(&pair).await;
                    flight.complete(Err(Error::NoRefreshToken));
                    return Err(original);
                }
                let queued = flight.complete(Ok(pair.access_token.clone()));
                metrics::counter!("session_token_refresh_total", "outcome" => "success")
                    .increment(1);
                info!(queued, "token refresh succeeded");

                if self.options.rehydrate_profile {
                    self.rehydrate(&pair).await;
                }
                Ok(pair.access_token)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, ending session");
                metrics::counter!("session_token_refresh_total", "outcome" => "failure")
                    .increment(1);
                let err = Error::Refresh(e.to_string());
                flight.reject(err.clone());
                self.end_session().await;
                flight.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Write the new pair back. A store failure is logged: the token is
    /// still handed to every waiting request.
    async fn persist(&self, pair: &TokenPair) {
        let secure = self.options.secure_cookies;
        if let Err(e) = self
            .store
            .set(
                ACCESS_TOKEN,
                pair.access_token.clone(),
                CookieOptions::lax(ACCESS_TOKEN_EXPIRY_DAYS, secure),
            )
            .await
        {
            warn!(error = %e, "failed to persist refreshed access token");
        }
        if let Err(e) = self
            .store
            .set(
                REFRESH_TOKEN,
                pair.refresh_token.clone(),
                CookieOptions::lax(REFRESH_TOKEN_EXPIRY_DAYS, secure),
            )
            .await
        {
            warn!(error = %e, "failed to persist refreshed refresh token");
        }
    }

    /// Remove entries `persist` wrote for `pair`, leaving any newer session.
    async fn discard(&self, pair: &TokenPair) {
        for (name, value) in [
            (ACCESS_TOKEN, &pair.access_token),
            (REFRESH_TOKEN, &pair.refresh_token),
        ] {
            if self.store.get(name).await.as_ref() == Some(value)
                && let Err(e) = self.store.remove(name, COOKIE_PATH).await
            {
                warn!(name, error = %e, "failed to discard refreshed credential");
            }
        }
    }

    /// Best-effort profile reload after a refresh. Never fails the refresh.
    ///
    /// The tokens were already persisted, so only the user and role marker
    /// are written. Nothing is written if the session was cleared or the
    /// token replaced while the profile was loading.
    async fn rehydrate(&self, pair: &TokenPair) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let fetched =
            billmate_auth::fetch_profile(&self.http, &self.base_url, &pair.access_token).await;
        let user = match fetched {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "could not restore user profile after token refresh");
                return;
            }
        };

        let current = self.store.get(ACCESS_TOKEN).await;
        if self.epoch.load(Ordering::Acquire) != epoch
            || current.as_deref() != Some(pair.access_token.as_str())
        {
            debug!("session changed while loading profile, discarding it");
            return;
        }
        self.sink.update_user(user).await;

        // A sign-out that raced the write above must still win
        if self.epoch.load(Ordering::Acquire) != epoch {
            self.sink.clear();
            if let Err(e) = self.store.remove(USER_ROLE, COOKIE_PATH).await {
                warn!(error = %e, "failed to clear role marker");
            }
            return;
        }
        debug!("user profile restored after token refresh");
    }

    async fn clear_credentials(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for name in [ACCESS_TOKEN, REFRESH_TOKEN, USER_ROLE] {
            if let Err(e) = self.store.remove(name, COOKIE_PATH).await {
                warn!(name, error = %e, "failed to clear credential");
            }
        }
        self.sink.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ownership of the in-flight refresh.
///
/// `complete` drains the queue and returns the state to `Idle`. If the owner
/// is dropped first (its caller went away mid-refresh), every queued request
/// is rejected with `RefreshAbandoned` so none is left waiting.
struct Flight<'a> {
    coordinator: &'a SessionCoordinator,
    done: bool,
}

impl<'a> Flight<'a> {
    fn new(coordinator: &'a SessionCoordinator) -> Self {
        Self {
            coordinator,
            done: false,
        }
    }

    /// Settle the requests queued so far without leaving `Refreshing`.
    fn reject(&self, err: Error) {
        let mut state = self.coordinator.lock_state();
        if let RefreshState::Refreshing { waiters } = &mut *state {
            settle(waiters, &Err(err));
        }
    }

    /// Settle every queued request in FIFO order, then return to `Idle`.
    /// Returns how many requests were settled.
    fn complete(mut self, outcome: Result<String>) -> usize {
        self.done = true;
        let mut state = self.coordinator.lock_state();
        let settled = match &mut *state {
            RefreshState::Refreshing { waiters } => settle(waiters, &outcome),
            RefreshState::Idle => 0,
        };
        *state = RefreshState::Idle;
        self.coordinator.generation.fetch_add(1, Ordering::AcqRel);
        settled
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("token refresh abandoned, rejecting queued requests");
        let mut state = self.coordinator.lock_state();
        if let RefreshState::Refreshing { waiters } = &mut *state {
            settle(waiters, &Err(Error::RefreshAbandoned));
        }
        *state = RefreshState::Idle;
        self.coordinator.generation.fetch_add(1, Ordering::AcqRel);
    }
}

fn settle(waiters: &mut VecDeque<Waiter>, outcome: &Result<String>) -> usize {
    let mut settled = 0;
    while let Some(waiter) = waiters.pop_front() {
        // A closed receiver means that caller stopped waiting.
        let _ = waiter.send(outcome.clone());
        settled += 1;
    }
    settled
}
