//! The realtime client: channel subscriptions over one shared connection.
//!
//! [`RealtimeClient`] is the entry point applications hold on to. It owns the
//! connection manager and the subscription registry, converges concurrent
//! subscribe calls for the same channel onto one attempt, and retries channel
//! creation while the websocket handshake is still in flight. When realtime
//! is switched off the client degrades to doing nothing: `subscribe` returns
//! `Ok(None)` and cleanup calls are no-ops, so callers never need their own
//! feature-flag checks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::auth::AuthTokenStore;
use crate::config::RealtimeConfig;
use crate::realtime::connection::ConnectionManager;
use crate::realtime::subscription::{
    ChannelSubscription, SharedSubscribeAttempt, SubscriptionRegistry,
};
use crate::realtime::transport::{
    Connection, ConnectionPhase, Connector, OpenedChannel, TransportError,
};
use crate::realtime::ws::WsConnector;
use crate::realtime::{RealtimeError, RealtimeStatus};
use crate::retry::{retry_async, RetryError, RetryPolicy};

/// Client for the realtime channel service.
///
/// Clones are cheap and share the same connection and subscriptions.
#[derive(Clone)]
pub struct RealtimeClient {
    config: RealtimeConfig,
    channel_retry: RetryPolicy,
    manager: ConnectionManager,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    // Bumped by reset(); a subscribe attempt finishing under an older epoch
    // resolves to Reset instead of registering its channel.
    epoch: Arc<AtomicU64>,
}

impl RealtimeClient {
    /// Creates a client that connects over websockets.
    pub fn new(config: RealtimeConfig, auth: AuthTokenStore) -> Self {
        Self::with_connector(config, auth, Arc::new(WsConnector::new()))
    }

    /// Creates a client on top of a custom transport connector.
    pub fn with_connector(
        config: RealtimeConfig,
        auth: AuthTokenStore,
        connector: Arc<dyn Connector>,
    ) -> Self {
        if config.enabled() && config.connection_hash().is_none() {
            warn!(
                event = "realtime_unavailable",
                reason = "connection hash is missing"
            );
        }
        let manager = ConnectionManager::new(config.clone(), auth, connector);
        Self {
            config,
            channel_retry: RetryPolicy::channel_open(),
            manager,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::default())),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replaces the retry policy used when opening channels.
    pub fn with_channel_retry(mut self, policy: RetryPolicy) -> Self {
        self.channel_retry = policy;
        self
    }

    /// Subscribes to a channel, returning the live subscription.
    ///
    /// Returns `Ok(None)` when realtime is disabled or not configured; that
    /// case is a logged no-op rather than an error. Subscribing to a channel
    /// that is already live returns the existing subscription, and concurrent
    /// calls for the same channel share a single attempt. The connection is
    /// established on first use; channel creation retries with backoff while
    /// the handshake is still settling.
    pub async fn subscribe(
        &self,
        channel_name: &str,
    ) -> Result<Option<Arc<ChannelSubscription>>, RealtimeError> {
        if !self.config.enabled() {
            warn!(event = "realtime_disabled", channel = %channel_name);
            return Ok(None);
        }
        if self.config.connection_hash().is_none() {
            warn!(event = "realtime_hash_missing", channel = %channel_name);
            return Ok(None);
        }

        let attempt = {
            let mut registry = self.lock_registry();
            if let Some(existing) = registry.active.get(channel_name) {
                warn!(event = "already_subscribed", channel = %channel_name);
                return Ok(Some(Arc::clone(existing)));
            }
            match registry.pending.get(channel_name) {
                Some(pending) => pending.clone(),
                None => {
                    let attempt = self.spawn_subscribe_attempt(channel_name.to_string());
                    registry
                        .pending
                        .insert(channel_name.to_string(), attempt.clone());
                    attempt
                }
            }
        };

        attempt.await.map(Some)
    }

    /// Destroys a subscription previously returned by [`Self::subscribe`].
    ///
    /// Accepts the `Option` shape `subscribe` produces so disabled-mode
    /// callers can pass their `None` straight back.
    pub fn unsubscribe(&self, subscription: Option<&Arc<ChannelSubscription>>) {
        if !self.config.enabled() {
            return;
        }
        let Some(subscription) = subscription else {
            return;
        };
        subscription.destroy();
    }

    /// Destroys every subscription and drops the connection.
    ///
    /// In-flight subscribe calls resolve with [`RealtimeError::Reset`]. The
    /// client stays usable: the next subscribe establishes a fresh
    /// connection.
    pub fn reset(&self) {
        debug!(event = "resetting_realtime_client");
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let (active, pending) = {
            let mut registry = self.lock_registry();
            (
                std::mem::take(&mut registry.active),
                std::mem::take(&mut registry.pending),
            )
        };
        drop(pending);
        for (name, subscription) in active {
            debug!(event = "cleaning_up_subscription", channel = %name);
            subscription.destroy();
        }

        self.manager.clear();
    }

    /// Current connection status.
    pub fn status(&self) -> RealtimeStatus {
        if !self.config.is_available() {
            return RealtimeStatus::Disabled;
        }
        match self.manager.current() {
            Some(connection) => match connection.phase() {
                ConnectionPhase::Connecting => RealtimeStatus::Connecting,
                ConnectionPhase::Ready => RealtimeStatus::Live,
                ConnectionPhase::Failed | ConnectionPhase::Closed => RealtimeStatus::Disconnected,
            },
            None if self.manager.attempt_in_flight() => RealtimeStatus::Connecting,
            None => RealtimeStatus::Disconnected,
        }
    }

    /// Establishes the connection eagerly instead of on first subscribe.
    ///
    /// A no-op when realtime is disabled or not configured.
    pub async fn ensure_connected(&self) -> Result<(), RealtimeError> {
        if !self.config.is_available() {
            debug!(event = "realtime_disabled_skip_connect");
            return Ok(());
        }
        self.manager.get_or_create().await.map(|_| ())
    }

    /// True when realtime is switched on and configured with a hash.
    pub fn is_enabled(&self) -> bool {
        self.config.is_available()
    }

    /// Number of live channel subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.lock_registry().active.len()
    }

    fn spawn_subscribe_attempt(&self, name: String) -> SharedSubscribeAttempt {
        let manager = self.manager.clone();
        let registry = Arc::clone(&self.registry);
        let policy = self.channel_retry.clone();
        let epoch = Arc::clone(&self.epoch);
        let captured = epoch.load(Ordering::SeqCst);

        async move {
            let outcome = open_named_channel(&manager, &policy, &name).await;

            let mut state = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if epoch.load(Ordering::SeqCst) != captured {
                drop(state);
                if let Ok((_, opened)) = outcome {
                    if let Err(err) = opened.handle.destroy() {
                        warn!(event = "channel_cleanup_failed", channel = %name, error = %err);
                    }
                }
                debug!(event = "subscribe_cancelled_by_reset", channel = %name);
                return Err(RealtimeError::Reset);
            }
            state.pending.remove(&name);

            match outcome {
                Ok((connection, opened)) => {
                    let subscription =
                        ChannelSubscription::spawn(name.clone(), opened, &connection, &registry);
                    state.active.insert(name.clone(), Arc::clone(&subscription));
                    debug!(event = "subscribed", channel = %name);
                    Ok(subscription)
                }
                Err(error) => {
                    warn!(event = "subscribe_failed", channel = %name, error = %error);
                    Err(error)
                }
            }
        }
        .boxed()
        .shared()
    }

    fn lock_registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Opens a channel on the shared connection, retrying while the websocket
/// handshake is still establishing.
async fn open_named_channel(
    manager: &ConnectionManager,
    policy: &RetryPolicy,
    name: &str,
) -> Result<(Arc<dyn Connection>, OpenedChannel), RealtimeError> {
    let connection = manager.get_or_create().await?;

    let opened = retry_async(
        policy,
        |attempt| {
            let connection = Arc::clone(&connection);
            let name = name.to_string();
            async move {
                debug!(event = "creating_channel", channel = %name, attempt);
                connection.open_channel(&name).await
            }
        },
        TransportError::is_still_connecting,
    )
    .await
    .map_err(|error| match error {
        RetryError::Fatal(error) => RealtimeError::Transport(error),
        RetryError::Exhausted { attempts, last } => {
            RealtimeError::RetriesExhausted { attempts, last }
        }
    })?;

    Ok((connection, opened))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;
    use serde_json::json;

    use super::RealtimeClient;
    use crate::auth::AuthTokenStore;
    use crate::config::RealtimeConfig;
    use crate::realtime::proto::{EventAction, RealtimeEvent};
    use crate::realtime::transport::scripted::ScriptedConnector;
    use crate::realtime::transport::{ConnectionPhase, TransportError};
    use crate::realtime::{RealtimeError, RealtimeStatus};
    use crate::retry::RetryPolicy;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime")
    }

    fn enabled_config() -> RealtimeConfig {
        RealtimeConfig::new(SecretString::new("test-hash".to_string()))
    }

    fn fast_retry(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn new_client(connector: &Arc<ScriptedConnector>) -> RealtimeClient {
        RealtimeClient::with_connector(
            enabled_config(),
            AuthTokenStore::new(),
            Arc::clone(connector) as Arc<_>,
        )
    }

    fn event(id: u64, sent_at_ms: Option<u64>) -> RealtimeEvent {
        RealtimeEvent {
            action: EventAction::Message,
            payload: json!({ "id": id }),
            sent_at_ms,
        }
    }

    #[test]
    fn disabled_client_subscribes_to_nothing() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = RealtimeClient::with_connector(
                RealtimeConfig::disabled(),
                AuthTokenStore::new(),
                Arc::clone(&connector) as Arc<_>,
            );

            let subscription = client.subscribe("dashboard/1").await.expect("no error");
            assert!(subscription.is_none());
            assert_eq!(connector.connect_calls(), 0);
            assert_eq!(client.status(), RealtimeStatus::Disabled);
            assert!(!client.is_enabled());

            client.ensure_connected().await.expect("no-op");
            assert_eq!(connector.connect_calls(), 0);
        });
    }

    #[test]
    fn enabled_without_hash_subscribes_to_nothing() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = RealtimeClient::with_connector(
                RealtimeConfig::disabled().with_enabled(true),
                AuthTokenStore::new(),
                Arc::clone(&connector) as Arc<_>,
            );

            let subscription = client.subscribe("dashboard/1").await.expect("no error");
            assert!(subscription.is_none());
            assert_eq!(connector.connect_calls(), 0);
            assert_eq!(client.status(), RealtimeStatus::Disabled);
        });
    }

    #[test]
    fn resubscribe_returns_the_existing_subscription() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            let first = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            let second = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(connector.connect_calls(), 1);
            assert_eq!(connector.open_calls(), 1);
            assert_eq!(client.subscription_count(), 1);
        });
    }

    #[test]
    fn concurrent_subscribes_share_one_attempt() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);
            connector.hold_connects();

            let releaser = {
                let connector = Arc::clone(&connector);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    connector.release_connects();
                })
            };
            let (first, second) = tokio::join!(
                client.subscribe("dashboard/1"),
                client.subscribe("dashboard/1"),
            );
            releaser.await.expect("releaser");

            let first = first.expect("subscribe").expect("enabled");
            let second = second.expect("subscribe").expect("enabled");
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(connector.connect_calls(), 1);
            assert_eq!(connector.open_calls(), 1);
            assert_eq!(client.subscription_count(), 1);
        });
    }

    #[test]
    fn distinct_channels_share_the_connection() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            let first = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            let second = client
                .subscribe("dashboard/2")
                .await
                .expect("subscribe")
                .expect("enabled");

            assert!(!Arc::ptr_eq(&first, &second));
            assert_eq!(connector.connect_calls(), 1);
            assert_eq!(connector.open_calls(), 2);
            assert_eq!(client.subscription_count(), 2);
        });
    }

    #[test]
    fn events_flow_through_the_subscription() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            let subscription = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            let mut events = subscription.take_events().expect("receiver");
            let scripted = connector.last_connection().expect("connection");

            // A redelivered event differs only in its send timestamp.
            assert!(scripted.push_event("dashboard/1", event(1, Some(5))));
            assert!(scripted.push_event("dashboard/1", event(1, Some(6))));
            assert!(scripted.push_event("dashboard/1", event(2, Some(7))));

            assert_eq!(
                events.recv().await.expect("first").payload,
                json!({ "id": 1 })
            );
            assert_eq!(
                events.recv().await.expect("second").payload,
                json!({ "id": 2 })
            );
        });
    }

    #[test]
    fn unsubscribe_tolerates_none_and_repeats() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            client.unsubscribe(None);

            let subscription = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            client.unsubscribe(Some(&subscription));
            client.unsubscribe(Some(&subscription));

            assert!(subscription.is_destroyed());
            assert_eq!(client.subscription_count(), 0);
            let scripted = connector.last_connection().expect("connection");
            assert_eq!(scripted.destroyed_channels(), vec!["dashboard/1".to_string()]);
        });
    }

    #[test]
    fn unsubscribed_channel_can_be_opened_again() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            let first = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            client.unsubscribe(Some(&first));

            let second = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            assert!(!Arc::ptr_eq(&first, &second));
            assert!(!second.is_destroyed());
            assert_eq!(connector.connect_calls(), 1);
            assert_eq!(connector.open_calls(), 2);
        });
    }

    #[test]
    fn reset_with_nothing_live_is_harmless() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            client.reset();

            assert_eq!(client.subscription_count(), 0);
            assert_eq!(client.status(), RealtimeStatus::Disconnected);
            assert_eq!(connector.connect_calls(), 0);
        });
    }

    #[test]
    fn reset_destroys_subscriptions_and_reconnects_on_demand() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);

            let subscription = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            let old_connection = connector.last_connection().expect("connection");

            client.reset();

            assert!(subscription.is_destroyed());
            assert!(old_connection.is_closed());
            assert_eq!(client.subscription_count(), 0);
            assert_eq!(client.status(), RealtimeStatus::Disconnected);

            let fresh = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            assert!(!Arc::ptr_eq(&subscription, &fresh));
            assert_eq!(connector.connect_calls(), 2);
        });
    }

    #[test]
    fn reset_during_subscribe_cancels_the_attempt() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);
            connector.hold_connects();

            let pending = {
                let client = client.clone();
                tokio::spawn(async move { client.subscribe("dashboard/1").await })
            };
            tokio::time::sleep(Duration::from_millis(5)).await;

            client.reset();
            connector.release_connects();

            let outcome = pending.await.expect("task");
            assert_eq!(outcome.expect_err("cancelled"), RealtimeError::Reset);
            // The late connection was discarded, not installed.
            assert!(connector.last_connection().expect("connection").is_closed());
            assert_eq!(client.subscription_count(), 0);
            assert_eq!(client.status(), RealtimeStatus::Disconnected);

            let fresh = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            assert!(!fresh.is_destroyed());
            assert_eq!(connector.connect_calls(), 2);
        });
    }

    #[test]
    fn channel_creation_retries_while_still_connecting() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector).with_channel_retry(fast_retry(5));
            connector.fail_next_opens([
                TransportError::StillConnecting,
                TransportError::StillConnecting,
                TransportError::StillConnecting,
            ]);

            let subscription = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");

            assert!(!subscription.is_destroyed());
            assert_eq!(connector.open_calls(), 4);
            assert_eq!(client.subscription_count(), 1);
        });
    }

    #[test]
    fn channel_creation_reports_exhaustion() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector).with_channel_retry(fast_retry(3));
            connector.fail_next_opens([
                TransportError::StillConnecting,
                TransportError::StillConnecting,
                TransportError::StillConnecting,
            ]);

            let error = client
                .subscribe("dashboard/1")
                .await
                .expect_err("exhausted");
            assert_eq!(
                error,
                RealtimeError::RetriesExhausted {
                    attempts: 3,
                    last: TransportError::StillConnecting,
                }
            );
            assert_eq!(connector.open_calls(), 3);
            assert_eq!(client.subscription_count(), 0);
        });
    }

    #[test]
    fn fatal_channel_error_is_not_retried() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector).with_channel_retry(fast_retry(5));
            connector.fail_next_opens([TransportError::Protocol("unknown channel".to_string())]);

            let error = client.subscribe("dashboard/1").await.expect_err("fatal");
            assert_eq!(
                error,
                RealtimeError::Transport(TransportError::Protocol(
                    "unknown channel".to_string()
                ))
            );
            assert_eq!(connector.open_calls(), 1);
        });
    }

    #[test]
    fn failed_connect_surfaces_and_the_next_subscribe_recovers() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);
            connector.fail_next_connect(TransportError::WebSocket("refused".to_string()));

            let error = client.subscribe("dashboard/1").await.expect_err("connect");
            assert_eq!(
                error,
                RealtimeError::Transport(TransportError::WebSocket("refused".to_string()))
            );
            assert_eq!(connector.open_calls(), 0);

            let subscription = client
                .subscribe("dashboard/1")
                .await
                .expect("subscribe")
                .expect("enabled");
            assert!(!subscription.is_destroyed());
            assert_eq!(connector.connect_calls(), 2);
        });
    }

    #[test]
    fn status_follows_the_connection_lifecycle() {
        runtime().block_on(async {
            let connector = ScriptedConnector::new();
            let client = new_client(&connector);
            assert_eq!(client.status(), RealtimeStatus::Disconnected);

            connector.hold_connects();
            let connecting = {
                let client = client.clone();
                tokio::spawn(async move { client.ensure_connected().await })
            };
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(client.status(), RealtimeStatus::Connecting);

            connector.release_connects();
            connecting.await.expect("task").expect("connected");
            assert_eq!(client.status(), RealtimeStatus::Live);

            let scripted = connector.last_connection().expect("connection");
            scripted.set_phase(ConnectionPhase::Failed);
            assert_eq!(client.status(), RealtimeStatus::Disconnected);

            client.reset();
            assert_eq!(client.status(), RealtimeStatus::Disconnected);
        });
    }
}
