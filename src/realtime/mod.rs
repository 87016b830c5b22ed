//! Realtime channel subscription client.
//!
//! One websocket connection is shared by every channel subscription. The
//! pieces are layered from the wire up:
//! - `proto`: messages exchanged with the realtime service.
//! - `transport`: connector, connection, and channel contracts.
//! - `ws`: websocket transport implementation.
//! - `connection`: single shared connection ownership and lifecycle.
//! - `subscription`: per-channel handle, dedup pump, and event stream.
//! - `client`: subscription registry and the application-facing entry points.

use thiserror::Error;

use self::transport::TransportError;

/// Realtime channel subscription entry points.
pub mod client;
/// Shared connection ownership.
pub mod connection;
/// Wire protocol messages and event types.
pub mod proto;
/// Per-channel subscription handle and event delivery.
pub mod subscription;
/// Transport contracts between the client and a connector implementation.
pub mod transport;
/// Websocket transport.
pub mod ws;

/// Errors surfaced by the realtime client.
///
/// Absent configuration is not an error: disabled realtime shows up as an
/// `Ok(None)` subscription, never as a variant here.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RealtimeError {
    /// Transport failure that is not retried at this layer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Channel creation kept losing the race with the connection handshake.
    #[error("channel creation exhausted {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: usize,
        /// Error returned by the final attempt.
        last: TransportError,
    },
    /// The client was reset while the operation was in flight.
    #[error("realtime client was reset")]
    Reset,
}

/// Connection status as surfaced to status displays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RealtimeStatus {
    /// Realtime is switched off by configuration; data is static.
    Disabled,
    /// No live connection and none being established.
    Disconnected,
    /// A connection is being established.
    Connecting,
    /// The shared connection is ready and events can flow.
    Live,
}
