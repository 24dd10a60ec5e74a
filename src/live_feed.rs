//! Live-data channel: a Socket.IO namespace reached over a WebSocket.
//!
//! [`SocketIoConnector::open`] dials the vendor and spawns one task that owns
//! the socket. The session talks to that task through a [`FeedChannel`]:
//! [`ClientEvent`]s go out, [`ServerEvent`]s come back in arrival order. The
//! task ends after reporting [`ServerEvent::Disconnected`], or when the
//! session drops its command sender.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::auth::Credential;
use crate::error::BridgeError;
use crate::models::{LocationId, ReadingBatch};
use crate::socketio::{EnginePacket, SocketPacket, ENGINE_IO_VERSION};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Requests the session sends to the vendor.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Authenticate(Credential),
    Subscribe(LocationId),
}

/// Notifications from the vendor, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The namespace accepted the connection.
    Connected,
    Authorized,
    Unauthorized(String),
    Data(ReadingBatch),
    /// Non-fatal channel fault.
    Error(String),
    /// The transport is gone. Always the last event.
    Disconnected(String),
}

/// Session-side ends of an open live channel.
pub struct FeedChannel {
    pub commands: mpsc::UnboundedSender<ClientEvent>,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Opens live channels authenticated with a given token.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn open(&self, credential: &Credential) -> Result<FeedChannel, BridgeError>;
}

pub struct SocketIoConnector {
    endpoint: Url,
}

impl SocketIoConnector {
    /// `endpoint` is the namespace URL, e.g. `https://app.energycurb.com/api/circuit-data`.
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl FeedConnector for SocketIoConnector {
    async fn open(&self, credential: &Credential) -> Result<FeedChannel, BridgeError> {
        let (ws_url, namespace) = websocket_url(&self.endpoint, credential)?;

        info!(
            host = ws_url.host_str().unwrap_or_default(),
            namespace = %namespace,
            "Connecting to live data channel"
        );
        let (ws_stream, _response) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| BridgeError::Transport(format!("WebSocket connect failed: {e}")))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let driver = ChannelDriver {
            namespace,
            token_query: token_query(credential),
            events: event_tx,
        };
        tokio::spawn(driver.run(ws_stream, command_rx));

        Ok(FeedChannel {
            commands: command_tx,
            events: event_rx,
        })
    }
}

/// Map the namespace URL onto the Engine.IO WebSocket endpoint.
///
/// Returns the WebSocket URL (carrying the token) and the namespace path.
pub fn websocket_url(endpoint: &Url, credential: &Credential) -> Result<(Url, String), BridgeError> {
    let scheme = match endpoint.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(BridgeError::Transport(format!(
                "unsupported live data scheme '{other}'"
            )))
        }
    };

    let namespace = match endpoint.path().trim_end_matches('/') {
        "" => "/".to_string(),
        path => path.to_string(),
    };

    let mut ws_url = endpoint.clone();
    ws_url
        .set_scheme(scheme)
        .map_err(|()| BridgeError::Transport(format!("cannot use {scheme} for {endpoint}")))?;
    ws_url.set_path("/socket.io/");
    ws_url.set_fragment(None);
    ws_url
        .query_pairs_mut()
        .clear()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket")
        .append_pair("token", credential.expose());

    Ok((ws_url, namespace))
}

fn token_query(credential: &Credential) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("token", credential.expose())
        .finish()
}

fn client_packet(namespace: &str, event: &ClientEvent) -> SocketPacket {
    match event {
        ClientEvent::Authenticate(credential) => SocketPacket::event(
            namespace,
            "authenticate",
            vec![json!({ "token": credential.expose() })],
        ),
        ClientEvent::Subscribe(location) => {
            SocketPacket::event(namespace, "subscribe", vec![json!(location.as_str())])
        }
    }
}

/// Translate a named vendor event. `None` for events the bridge ignores.
pub fn server_event(name: &str, args: Vec<Value>) -> Option<ServerEvent> {
    let first = args.into_iter().next();
    match name {
        "authorized" => Some(ServerEvent::Authorized),
        "unauthorized" => Some(ServerEvent::Unauthorized(describe(first))),
        "data" => {
            let Some(body) = first else {
                return Some(ServerEvent::Error("data event without payload".to_string()));
            };
            Some(match serde_json::from_value::<ReadingBatch>(body) {
                Ok(batch) => ServerEvent::Data(batch),
                Err(e) => ServerEvent::Error(format!("undecodable data event: {e}")),
            })
        }
        "error" => Some(ServerEvent::Error(describe(first))),
        _ => None,
    }
}

/// Human-readable text for an error/reason payload.
fn describe(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => "no reason given".to_string(),
        Some(Value::String(text)) => text,
        Some(Value::Object(map)) => match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => Value::Object(map).to_string(),
        },
        Some(other) => other.to_string(),
    }
}

/// Heartbeat bookkeeping once the Engine.IO handshake is known.
struct Heartbeat {
    ticker: Interval,
    deadline: Duration,
    last_pong: Instant,
}

impl Heartbeat {
    fn new(ping_interval_ms: u64, ping_timeout_ms: u64) -> Self {
        let period = Duration::from_millis(ping_interval_ms.max(1));
        Self {
            ticker: interval_at(Instant::now() + period, period),
            deadline: period + Duration::from_millis(ping_timeout_ms),
            last_pong: Instant::now(),
        }
    }

    async fn tick(heartbeat: &mut Option<Heartbeat>) {
        match heartbeat {
            Some(hb) => {
                hb.ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

struct ChannelDriver {
    namespace: String,
    token_query: String,
    events: mpsc::Sender<ServerEvent>,
}

enum Flow {
    Continue,
    Closed(String),
}

impl ChannelDriver {
    async fn run<S>(self, ws_stream: S, mut commands: mpsc::UnboundedReceiver<ClientEvent>)
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
            + Send
            + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat: Option<Heartbeat> = None;

        let reason = loop {
            tokio::select! {
                frame = read.next() => {
                    let outgoing = match frame {
                        Some(Ok(Message::Text(text))) => {
                            match self.on_frame(text.as_str(), &mut heartbeat).await {
                                Ok(outgoing) => outgoing,
                                Err(reason) => break reason,
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|cf| format!("WebSocket closed ({}): {}", cf.code, cf.reason))
                                .unwrap_or_else(|| "WebSocket closed".to_string());
                        }
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(e)) => {
                            self.emit(ServerEvent::Error(e.to_string())).await;
                            break format!("WebSocket read failed: {e}");
                        }
                        None => break "WebSocket stream ended".to_string(),
                    };
                    if let Flow::Closed(reason) = send_frames(&mut write, outgoing).await {
                        break reason;
                    }
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("Session released the live channel; closing");
                        let goodbye = SocketPacket::Disconnect { namespace: self.namespace.clone() };
                        let _ = send_frames(&mut write, vec![goodbye.to_frame()]).await;
                        let _ = write.close().await;
                        return;
                    };
                    let frame = client_packet(&self.namespace, &command).to_frame();
                    if let Flow::Closed(reason) = send_frames(&mut write, vec![frame]).await {
                        break reason;
                    }
                }
                () = Heartbeat::tick(&mut heartbeat) => {
                    let expired = heartbeat
                        .as_ref()
                        .is_some_and(|hb| hb.last_pong.elapsed() > hb.deadline);
                    if expired {
                        break "ping timeout".to_string();
                    }
                    let ping = EnginePacket::Ping(String::new()).encode();
                    if let Flow::Closed(reason) = send_frames(&mut write, vec![ping]).await {
                        break reason;
                    }
                }
            }
        };

        self.emit(ServerEvent::Disconnected(reason)).await;
    }

    /// Handle one text frame; returns frames to send back, or the reason the
    /// connection is over.
    async fn on_frame(
        &self,
        text: &str,
        heartbeat: &mut Option<Heartbeat>,
    ) -> Result<Vec<String>, String> {
        trace!(frame = text, "Live channel frame");
        let packet = match EnginePacket::decode(text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable frame");
                return Ok(Vec::new());
            }
        };

        match packet {
            EnginePacket::Open(handshake) => {
                debug!(
                    ping_interval_ms = handshake.ping_interval,
                    ping_timeout_ms = handshake.ping_timeout,
                    "Engine.IO session opened"
                );
                *heartbeat = Some(Heartbeat::new(handshake.ping_interval, handshake.ping_timeout));
                let join = SocketPacket::Connect {
                    namespace: self.namespace.clone(),
                    query: Some(self.token_query.clone()),
                };
                Ok(vec![join.to_frame()])
            }
            EnginePacket::Ping(data) => Ok(vec![EnginePacket::Pong(data).encode()]),
            EnginePacket::Pong(_) => {
                if let Some(hb) = heartbeat.as_mut() {
                    hb.last_pong = Instant::now();
                }
                Ok(Vec::new())
            }
            EnginePacket::Close => Err("server closed the Engine.IO session".to_string()),
            EnginePacket::Message(body) => self.on_message(&body).await.map(|()| Vec::new()),
            EnginePacket::Upgrade | EnginePacket::Noop => Ok(Vec::new()),
        }
    }

    async fn on_message(&self, body: &str) -> Result<(), String> {
        let packet = match SocketPacket::decode(body) {
            Ok(packet) => packet,
            Err(e) => {
                self.emit(ServerEvent::Error(format!("bad Socket.IO packet: {e}"))).await;
                return Ok(());
            }
        };
        if packet.namespace() != self.namespace {
            trace!(namespace = packet.namespace(), "Packet for another namespace");
            return Ok(());
        }

        match packet {
            SocketPacket::Connect { .. } => self.emit(ServerEvent::Connected).await,
            SocketPacket::Disconnect { .. } => {
                return Err("server disconnected the namespace".to_string());
            }
            SocketPacket::Event { name, args, .. } => match server_event(&name, args) {
                Some(event) => self.emit(event).await,
                None => debug!(event = %name, "Ignoring unhandled live event"),
            },
            SocketPacket::Error { data, .. } => self.emit(ServerEvent::Error(describe(Some(data)))).await,
            SocketPacket::Ack { id, .. } => trace!(id, "Ignoring ack"),
        }
        Ok(())
    }

    async fn emit(&self, event: ServerEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Live channel event dropped; session is gone");
        }
    }
}

async fn send_frames<W>(write: &mut W, frames: Vec<String>) -> Flow
where
    W: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    for frame in frames {
        if let Err(e) = write.send(Message::text(frame)).await {
            return Flow::Closed(format!("WebSocket write failed: {e}"));
        }
    }
    Flow::Continue
}
