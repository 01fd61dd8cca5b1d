//! Authentication provider interface.
//!
//! The transport asks the provider to shape every outgoing request, and
//! the scheduler follows the provider's login/logout notifications to
//! start and stop polling.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Login state change, broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    LoggedIn { email: String },
    LoggedOut,
}

/// Supplies credentials and login-state notifications.
pub trait AuthProvider: Send + Sync {
    /// Whether a user is currently authenticated.
    fn logged_in(&self) -> bool;

    /// Drops the current session, notifying subscribers. Called by the
    /// transport when the server answers 401.
    fn logout(&self);

    /// Subscribes to login/logout notifications.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    /// Rewrites an outgoing URL, for providers that route through a proxy.
    fn modify_url(&self, url: String) -> String {
        url
    }

    /// Attaches credentials to an outgoing request.
    fn modify_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
    }
}

/// Header-based authentication: stamps `user/domain` into a configurable
/// request header on every call.
pub struct HeaderAuth {
    header: String,
    user: String,
    domain: String,
    logged_in: AtomicBool,
    events: broadcast::Sender<AuthEvent>,
}

impl HeaderAuth {
    pub fn new(
        header: impl Into<String>,
        user: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            header: header.into(),
            user: user.into(),
            domain: domain.into(),
            logged_in: AtomicBool::new(true),
            events,
        }
    }

    /// Marks the session as authenticated again and notifies subscribers.
    pub fn login(&self) {
        self.logged_in.store(true, Ordering::SeqCst);
        let _ = self.events.send(AuthEvent::LoggedIn {
            email: self.user.clone(),
        });
    }
}

impl AuthProvider for HeaderAuth {
    fn logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn logout(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
        let _ = self.events.send(AuthEvent::LoggedOut);
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    fn modify_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(self.header.as_str(), format!("{}/{}", self.user, self.domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logout_flips_state_and_notifies() {
        let auth = HeaderAuth::new("X-Remote-User", "test@example.com", "example.com");
        let mut events = auth.subscribe();
        assert!(auth.logged_in());

        auth.logout();
        assert!(!auth.logged_in());
        assert!(matches!(events.try_recv().unwrap(), AuthEvent::LoggedOut));

        auth.login();
        assert!(auth.logged_in());
        assert!(matches!(
            events.try_recv().unwrap(),
            AuthEvent::LoggedIn { .. }
        ));
    }
}
