//! Client SDK for the BrightBase realtime channel service.
//!
//! The crate is organized around one shared websocket connection:
//! - `realtime`: connection ownership, channel subscriptions, and transport.
//! - `auth`: bearer token storage with change notifications.
//! - `config`: feature flag, endpoint selection, and connection secret.
//! - `retry`: bounded backoff used while a channel races the connection handshake.
//! - `dedup`: recency window that suppresses duplicate event delivery.

/// Auth token store shared between the application and the realtime client.
pub mod auth;
/// Realtime configuration sourced from the environment or built directly.
pub mod config;
/// Fixed-capacity duplicate suppression window.
pub mod dedup;
/// Realtime client, connection manager, subscriptions, and transport.
pub mod realtime;
/// Retry helpers used when opening channels.
pub mod retry;
