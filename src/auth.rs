//! Shared auth token store.
//!
//! The application owns one store and updates it on login and logout. The
//! realtime connection manager watches the store and re-applies the token to
//! the live connection whenever it changes, so a connection established before
//! login still picks up credentials afterward.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::watch;
use tracing::debug;

/// Bearer token holder with change notifications.
///
/// Clones share the same underlying slot. Token values are never logged.
#[derive(Clone)]
pub struct AuthTokenStore {
    tx: Arc<watch::Sender<Option<SecretString>>>,
}

impl AuthTokenStore {
    /// Creates an empty store with no token set.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replaces the stored token and notifies watchers.
    pub fn set_token(&self, token: Option<SecretString>) {
        debug!(event = "auth_token_updated", present = token.is_some());
        self.tx.send_replace(token);
    }

    /// Removes the stored token and notifies watchers.
    pub fn clear(&self) {
        self.set_token(None);
    }

    /// Returns a clone of the current token.
    pub fn token(&self) -> Option<SecretString> {
        self.tx.borrow().clone()
    }

    /// Subscribes to token changes.
    ///
    /// The returned receiver treats the current value as already seen; only
    /// subsequent updates wake `changed()`.
    pub fn watch(&self) -> watch::Receiver<Option<SecretString>> {
        self.tx.subscribe()
    }
}

impl Default for AuthTokenStore {
    fn default() -> Self {
        Self::new()
    }
}
