//! Navigation collaborator invoked when a session cannot be recovered

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::info;

/// Where the user is and how to send them to sign-in.
pub trait Navigator: Send + Sync {
    /// Current location path (for example `/dashboard`).
    fn current_location(&self) -> String;

    /// Send the user to the sign-in location.
    fn navigate_to_sign_in(&self, location: &str);
}

/// In-process navigator: tracks the current location and counts sign-in
/// navigations. Used by the gateway, where "navigating" means reporting the
/// sign-in requirement to callers.
#[derive(Debug)]
pub struct LocalNavigator {
    location: Mutex<String>,
    navigations: AtomicUsize,
}

impl LocalNavigator {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: Mutex::new(location.into()),
            navigations: AtomicUsize::new(0),
        }
    }

    /// Move to `location` without counting a sign-in navigation.
    pub fn visit(&self, location: impl Into<String>) {
        *self.location.lock().unwrap_or_else(|e| e.into_inner()) = location.into();
    }

    /// Number of sign-in navigations performed so far.
    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::Acquire)
    }
}

impl Navigator for LocalNavigator {
    fn current_location(&self) -> String {
        self.location
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn navigate_to_sign_in(&self, location: &str) {
        self.visit(location);
        self.navigations.fetch_add(1, Ordering::AcqRel);
        info!(location, "navigated to sign-in");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_moves_location_and_counts() {
        let nav = LocalNavigator::new("/dashboard");
        assert_eq!(nav.current_location(), "/dashboard");

        nav.navigate_to_sign_in("/login");
        assert_eq!(nav.current_location(), "/login");
        assert_eq!(nav.navigations(), 1);

        nav.visit("/customers");
        assert_eq!(nav.current_location(), "/customers");
        assert_eq!(nav.navigations(), 1);
    }
}
