//! Per-channel subscription handle and event delivery.
//!
//! Each subscription owns the transport channel handle, a background pump
//! that filters duplicates out of the inbound stream, and the receiver the
//! application consumes events from. Destruction is idempotent and never
//! fails: cleanup problems are logged and swallowed so teardown can always
//! proceed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures_util::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dedup::DedupWindow;
use crate::realtime::proto::RealtimeEvent;
use crate::realtime::transport::{ChannelHandle, ChannelMessage, Connection, OpenedChannel};
use crate::realtime::RealtimeError;

/// One in-flight subscribe call, shared by every concurrent caller for the
/// same channel name.
pub(crate) type SharedSubscribeAttempt =
    Shared<BoxFuture<'static, Result<Arc<ChannelSubscription>, RealtimeError>>>;

/// Registry of channel subscriptions, keyed by channel name.
///
/// `active` holds live subscriptions; `pending` holds subscribe attempts
/// that have not resolved yet. Exactly one entry per name exists across the
/// two maps at any time.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    pub(crate) active: HashMap<String, Arc<ChannelSubscription>>,
    pub(crate) pending: HashMap<String, SharedSubscribeAttempt>,
}

/// A live subscription to one realtime channel.
pub struct ChannelSubscription {
    name: String,
    handle: Box<dyn ChannelHandle>,
    connection: Weak<dyn Connection>,
    registry: Weak<Mutex<SubscriptionRegistry>>,
    destroyed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RealtimeEvent>>>,
}

impl ChannelSubscription {
    /// Wraps an opened transport channel and starts its delivery pump.
    pub(crate) fn spawn(
        name: String,
        opened: OpenedChannel,
        connection: &Arc<dyn Connection>,
        registry: &Arc<Mutex<SubscriptionRegistry>>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let destroyed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(deliver_events(
            name.clone(),
            opened.messages,
            events_tx,
            Arc::clone(&destroyed),
        ));

        Arc::new(Self {
            name,
            handle: opened.handle,
            connection: Arc::downgrade(connection),
            registry: Arc::downgrade(registry),
            destroyed,
            pump,
            events: Mutex::new(Some(events_rx)),
        })
    }

    /// The channel name this subscription is attached to.
    pub fn channel_name(&self) -> &str {
        &self.name
    }

    /// Whether `destroy` has already run.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The connection this subscription rides on, while the client still
    /// holds it. The reference is weak: a subscription never keeps a
    /// discarded connection alive.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.upgrade()
    }

    /// Takes the event receiver.
    ///
    /// Only the first caller gets it; later calls return `None`. The
    /// receiver ends when the subscription is destroyed or the connection
    /// goes away.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RealtimeEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Tears the subscription down.
    ///
    /// Removes the registry entry, destroys the transport channel, and stops
    /// delivery. Idempotent; cleanup errors are logged, never returned.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!(event = "subscription_already_destroyed", channel = %self.name);
            return;
        }
        debug!(event = "destroying_channel", channel = %self.name);

        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            // Only remove our own entry; after a reset the name may already
            // belong to a newer subscription.
            let is_ours = registry
                .active
                .get(&self.name)
                .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), self));
            if is_ours {
                registry.active.remove(&self.name);
            }
        }

        if let Err(err) = self.handle.destroy() {
            warn!(event = "channel_cleanup_failed", channel = %self.name, error = %err);
        }
        self.pump.abort();
    }
}

impl fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("name", &self.name)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn deliver_events(
    channel: String,
    mut messages: mpsc::UnboundedReceiver<ChannelMessage>,
    events_tx: mpsc::UnboundedSender<RealtimeEvent>,
    destroyed: Arc<AtomicBool>,
) {
    let mut window = DedupWindow::default();

    while let Some(message) = messages.recv().await {
        if destroyed.load(Ordering::SeqCst) {
            break;
        }
        match message {
            ChannelMessage::Event(event) => {
                if !window.insert(event.fingerprint()) {
                    trace!(event = "duplicate_event_dropped", channel = %channel);
                    continue;
                }
                if events_tx.send(event).is_err() {
                    debug!(event = "event_consumer_gone", channel = %channel);
                    break;
                }
            }
            ChannelMessage::Error { code, message } => {
                warn!(
                    event = "realtime_channel_error",
                    channel = %channel,
                    code = %code,
                    message = %message
                );
            }
        }
    }
}
