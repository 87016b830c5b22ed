//! Websocket transport for the realtime channel service.
//!
//! `connect` spawns a background worker that owns the socket and returns
//! immediately; callers observe the handshake through the connection phase
//! and get a still-connecting error from `open_channel` until it completes.
//! There is no reconnect loop here: once the socket drops, the connection
//! stays down until the client resets and connects fresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::realtime::proto::{ClientMessage, RealtimeEvent, ServerMessage};
use crate::realtime::transport::{
    ChannelHandle, ChannelMessage, ConnectParams, Connection, ConnectionPhase, Connector,
    OpenedChannel, TransportError,
};

/// Handshake header carrying the deployment connection hash.
pub const CONNECTION_HASH_HEADER: &str = "x-connection-hash";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ChannelMessage>>>>;
type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>;

/// Connector for the realtime websocket service.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, params: ConnectParams) -> Result<Arc<dyn Connection>, TransportError> {
        let request = build_request(&params)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let phase = Arc::new(watch::channel(ConnectionPhase::Connecting).0);

        tokio::spawn(connection_worker(
            request,
            outbound_rx,
            Arc::clone(&routes),
            Arc::clone(&phase),
        ));

        Ok(Arc::new(WsConnection {
            outbound: Arc::new(Mutex::new(Some(outbound_tx))),
            routes,
            phase,
        }))
    }
}

fn build_request(params: &ConnectParams) -> Result<Request, TransportError> {
    let mut request = params
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|err| TransportError::WebSocket(err.to_string()))?;

    let hash_header: HeaderValue = params.connection_hash.expose_secret().parse().map_err(|_| {
        TransportError::InvalidSecret("connection hash is not a valid header value".to_string())
    })?;
    request
        .headers_mut()
        .insert(CONNECTION_HASH_HEADER, hash_header);

    if let Some(token) = params.auth_token.as_ref() {
        let bearer: HeaderValue = format!("Bearer {}", token.expose_secret())
            .parse()
            .map_err(|_| {
                TransportError::InvalidSecret("auth token is not a valid header value".to_string())
            })?;
        request.headers_mut().insert("authorization", bearer);
    }

    Ok(request)
}

struct WsConnection {
    outbound: OutboundSlot,
    routes: Routes,
    phase: Arc<watch::Sender<ConnectionPhase>>,
}

impl WsConnection {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        send_frame(&self.outbound, message)
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn open_channel(&self, name: &str) -> Result<OpenedChannel, TransportError> {
        match self.phase() {
            ConnectionPhase::Connecting => return Err(TransportError::StillConnecting),
            ConnectionPhase::Failed | ConnectionPhase::Closed => {
                return Err(TransportError::Closed)
            }
            ConnectionPhase::Ready => {}
        }

        let (route_tx, route_rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            if routes.contains_key(name) {
                return Err(TransportError::Protocol(format!(
                    "channel already open: {name}"
                )));
            }
            routes.insert(name.to_string(), route_tx);
        }

        if let Err(err) = self.send(ClientMessage::Subscribe {
            channel: name.to_string(),
        }) {
            self.routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
            return Err(err);
        }

        debug!(event = "channel_opened", channel = name);
        Ok(OpenedChannel {
            handle: Box::new(WsChannelHandle {
                name: name.to_string(),
                routes: Arc::clone(&self.routes),
                outbound: Arc::clone(&self.outbound),
            }),
            messages: route_rx,
        })
    }

    fn set_auth_token(&self, token: Option<SecretString>) -> Result<(), TransportError> {
        self.send(ClientMessage::Authenticate {
            token: token.map(|value| value.expose_secret().to_string()),
        })
    }

    fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    fn phase_watch(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.subscribe()
    }

    fn close(&self) {
        self.phase.send_replace(ConnectionPhase::Closed);
        // Dropping the sender lets the worker shut the socket down gracefully.
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

struct WsChannelHandle {
    name: String,
    routes: Routes,
    outbound: OutboundSlot,
}

impl ChannelHandle for WsChannelHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn destroy(&self) -> Result<(), TransportError> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
        send_frame(
            &self.outbound,
            ClientMessage::Unsubscribe {
                channel: self.name.clone(),
            },
        )
    }
}

fn send_frame(outbound: &OutboundSlot, message: ClientMessage) -> Result<(), TransportError> {
    let slot = outbound.lock().unwrap_or_else(PoisonError::into_inner);
    match slot.as_ref() {
        Some(tx) => tx
            .send(message)
            .map_err(|_| TransportError::SendQueueClosed),
        None => Err(TransportError::SendQueueClosed),
    }
}

async fn connection_worker(
    request: Request,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    routes: Routes,
    phase: Arc<watch::Sender<ConnectionPhase>>,
) {
    let mut socket = match connect_async(request).await {
        Ok((socket, _)) => socket,
        Err(err) => {
            warn!(event = "realtime_connect_failed", error = %err);
            phase.send_replace(ConnectionPhase::Failed);
            return;
        }
    };

    if outbound_rx.is_closed() {
        let _ = socket.close(None).await;
        phase.send_replace(ConnectionPhase::Closed);
        return;
    }

    phase.send_replace(ConnectionPhase::Ready);
    debug!(event = "realtime_connected");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick completes immediately; consume it so pings start one
    // full interval after the handshake.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(client_msg) => {
                        if let Err(err) = send_client_message(&mut socket, &client_msg).await {
                            warn!(event = "realtime_send_failed", error = %err);
                            phase.send_replace(ConnectionPhase::Failed);
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        phase.send_replace(ConnectionPhase::Closed);
                        break;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => route_server_frame(&routes, &text),
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            phase.send_replace(ConnectionPhase::Failed);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(event = "realtime_socket_closed");
                        phase.send_replace(ConnectionPhase::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "realtime_socket_error", error = %err);
                        phase.send_replace(ConnectionPhase::Failed);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let ping = ClientMessage::Ping { client_time_ms: now_ms() };
                if let Err(err) = send_client_message(&mut socket, &ping).await {
                    warn!(event = "realtime_send_failed", error = %err);
                    phase.send_replace(ConnectionPhase::Failed);
                    break;
                }
            }
        }
    }

    // Ends delivery on every open channel whatever path exited the loop.
    routes
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

async fn send_client_message(
    socket: &mut WsSocket,
    message: &ClientMessage,
) -> Result<(), TransportError> {
    let text = message
        .to_text()
        .map_err(|err| TransportError::Json(err.to_string()))?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|err| TransportError::WebSocket(err.to_string()))
}

fn route_server_frame(routes: &Routes, text: &str) {
    let message = match ServerMessage::from_text(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(event = "unparseable_server_frame", error = %err);
            return;
        }
    };

    match message {
        ServerMessage::Event {
            channel,
            action,
            payload,
            sent_at_ms,
        } => {
            deliver(
                routes,
                &channel,
                ChannelMessage::Event(RealtimeEvent {
                    action,
                    payload,
                    sent_at_ms,
                }),
            );
        }
        ServerMessage::ChannelError {
            channel,
            code,
            message,
        } => {
            deliver(routes, &channel, ChannelMessage::Error { code, message });
        }
        ServerMessage::Pong { .. } => {}
    }
}

fn deliver(routes: &Routes, channel: &str, message: ChannelMessage) {
    let routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
    match routes.get(channel) {
        Some(route) => {
            if route.send(message).is_err() {
                trace!(event = "channel_receiver_gone", channel);
            }
        }
        None => trace!(event = "event_without_channel_route", channel),
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
