//! Ownership of the single shared realtime connection.
//!
//! All subscriptions ride one connection. The manager hands out the current
//! connection when one exists, and otherwise starts exactly one establishment
//! attempt that every concurrent caller awaits; winners and losers see the
//! same outcome. A failed attempt clears the in-flight marker so the next
//! caller starts fresh. The manager also snapshots the auth token for the
//! handshake and forwards later token changes to the live connection.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::AuthTokenStore;
use crate::config::RealtimeConfig;
use crate::realtime::transport::{ConnectParams, Connection, Connector, TransportError};
use crate::realtime::RealtimeError;

type ConnectionAttempt = Shared<BoxFuture<'static, Result<Arc<dyn Connection>, RealtimeError>>>;

/// Manages the shared connection lifecycle.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: RealtimeConfig,
    auth: AuthTokenStore,
    connector: Arc<dyn Connector>,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    current: Option<Arc<dyn Connection>>,
    attempt: Option<ConnectionAttempt>,
    token_task: Option<JoinHandle<()>>,
    // Bumped by clear(); an attempt finishing under an older generation
    // discards its connection instead of installing it.
    generation: u64,
}

impl ConnectionManager {
    pub fn new(config: RealtimeConfig, auth: AuthTokenStore, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                auth,
                connector,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Returns the shared connection, establishing it if necessary.
    ///
    /// When an establishment attempt is already in flight, this awaits that
    /// same attempt rather than starting another.
    pub async fn get_or_create(&self) -> Result<Arc<dyn Connection>, RealtimeError> {
        let attempt = {
            let mut state = self.lock_state();
            if let Some(connection) = state.current.as_ref() {
                return Ok(Arc::clone(connection));
            }
            match state.attempt.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    debug!(event = "initializing_realtime_connection");
                    let attempt = self.new_attempt(state.generation);
                    state.attempt = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// The live connection, if one is currently installed.
    pub fn current(&self) -> Option<Arc<dyn Connection>> {
        self.lock_state().current.clone()
    }

    /// Whether an establishment attempt is in flight.
    pub fn attempt_in_flight(&self) -> bool {
        self.lock_state().attempt.is_some()
    }

    /// Drops the connection, any in-flight attempt, and the token forwarder.
    ///
    /// Safe to call with nothing established; the next `get_or_create`
    /// starts from scratch.
    pub fn clear(&self) {
        let (connection, token_task) = {
            let mut state = self.lock_state();
            state.generation = state.generation.wrapping_add(1);
            state.attempt = None;
            (state.current.take(), state.token_task.take())
        };
        if let Some(task) = token_task {
            task.abort();
        }
        if let Some(connection) = connection {
            debug!(event = "closing_shared_connection");
            connection.close();
        }
    }

    fn new_attempt(&self, generation: u64) -> ConnectionAttempt {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = establish(&inner).await;

            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok((connection, token_watch)) => {
                    if state.generation != generation {
                        drop(state);
                        debug!(event = "connection_discarded_after_reset");
                        connection.close();
                        return Err(RealtimeError::Reset);
                    }
                    state.attempt = None;
                    state.current = Some(Arc::clone(&connection));
                    state.token_task = Some(spawn_token_forwarder(token_watch, &connection));
                    debug!(event = "realtime_connection_established");
                    Ok(connection)
                }
                Err(err) => {
                    if state.generation == generation {
                        state.attempt = None;
                    }
                    drop(state);
                    warn!(event = "connection_attempt_failed", error = %err);
                    Err(err)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn establish(
    inner: &Arc<ManagerInner>,
) -> Result<
    (
        Arc<dyn Connection>,
        watch::Receiver<Option<SecretString>>,
    ),
    RealtimeError,
> {
    let Some(connection_hash) = inner.config.connection_hash().cloned() else {
        return Err(RealtimeError::Transport(TransportError::InvalidSecret(
            "realtime connection hash is not configured".to_string(),
        )));
    };

    // Subscribing before the snapshot means a token change racing the
    // handshake is still forwarded afterward instead of being lost.
    let mut token_watch = inner.auth.watch();
    let auth_token = token_watch.borrow_and_update().clone();

    let params = ConnectParams {
        endpoint: inner.config.endpoint().to_string(),
        connection_hash,
        auth_token,
    };
    let connection = inner.connector.connect(params).await?;
    Ok((connection, token_watch))
}

// Holds the connection weakly so a cleared connection is not kept alive by
// its own forwarder while the abort settles.
fn spawn_token_forwarder(
    mut tokens: watch::Receiver<Option<SecretString>>,
    connection: &Arc<dyn Connection>,
) -> JoinHandle<()> {
    let connection = Arc::downgrade(connection);
    tokio::spawn(async move {
        while tokens.changed().await.is_ok() {
            let Some(connection) = connection.upgrade() else {
                break;
            };
            let token = tokens.borrow_and_update().clone();
            debug!(event = "reapplying_auth_token", present = token.is_some());
            if let Err(err) = connection.set_auth_token(token) {
                debug!(event = "auth_token_forwarding_stopped", error = %err);
                break;
            }
        }
    })
}
