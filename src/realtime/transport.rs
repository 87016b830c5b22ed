//! Transport contracts between the realtime client and a connector.
//!
//! The orchestration layers (connection manager, registry, subscriptions)
//! only ever talk to these traits. The bundled websocket transport implements
//! them for production; tests drive the same layers with a scripted connector.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::realtime::proto::RealtimeEvent;

/// Lifecycle phase of a transport session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionPhase {
    /// The session handshake has not completed yet.
    Connecting,
    /// The session is established and channels can be opened.
    Ready,
    /// The session failed and will not recover.
    Failed,
    /// The session was closed deliberately.
    Closed,
}

/// Parameters for establishing a transport session.
#[derive(Clone)]
pub struct ConnectParams {
    /// Websocket endpoint to connect to.
    pub endpoint: String,
    /// Deployment-identifying connection hash.
    pub connection_hash: SecretString,
    /// Bearer token to present at session setup, if the user is logged in.
    pub auth_token: Option<SecretString>,
}

/// Inbound item delivered on an open channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    /// A realtime event published on the channel.
    Event(RealtimeEvent),
    /// A channel-level error reported by the service.
    Error { code: String, message: String },
}

/// An open channel: its control handle plus the inbound message stream.
pub struct OpenedChannel {
    pub handle: Box<dyn ChannelHandle>,
    pub messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl fmt::Debug for OpenedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedChannel")
            .field("channel", &self.handle.name())
            .finish_non_exhaustive()
    }
}

/// Establishes transport sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Starts a session.
    ///
    /// Implementations may return before the session is ready; callers
    /// observe readiness through [`Connection::phase`] and get
    /// [`TransportError::StillConnecting`] from `open_channel` until then.
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live transport session shared by all channel subscriptions.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a named channel and starts delivering its messages.
    ///
    /// Fails with [`TransportError::StillConnecting`] while the session
    /// handshake is in progress.
    async fn open_channel(&self, name: &str) -> Result<OpenedChannel, TransportError>;

    /// Applies a new auth token to the live session.
    fn set_auth_token(&self, token: Option<SecretString>) -> Result<(), TransportError>;

    /// Current lifecycle phase.
    fn phase(&self) -> ConnectionPhase;

    /// Subscribes to phase transitions.
    fn phase_watch(&self) -> watch::Receiver<ConnectionPhase>;

    /// Tears the session down. Never fails; repeated calls are harmless.
    fn close(&self);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Control handle for one open channel.
pub trait ChannelHandle: Send + Sync {
    /// The channel name this handle controls.
    fn name(&self) -> &str;

    /// Stops delivery and tells the service to drop the channel.
    fn destroy(&self) -> Result<(), TransportError>;
}

/// Errors produced by transport implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The session handshake has not completed yet; worth retrying shortly.
    #[error("connection is still establishing")]
    StillConnecting,
    /// The session is gone and will not come back.
    #[error("connection is closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("json error: {0}")]
    Json(String),
    #[error("invalid connection secret: {0}")]
    InvalidSecret(String),
    /// The background worker owning the socket is no longer running.
    #[error("connection worker is gone")]
    SendQueueClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True when the failure is the transient still-establishing window.
    pub fn is_still_connecting(&self) -> bool {
        matches!(self, Self::StillConnecting)
    }
}
