use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::auth::Credential;
use crate::live_feed::{ClientEvent, ServerEvent};
use crate::models::{LocationId, OutboundMessage, ReadingBatch};
use crate::mqtt_service::MessagePublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Subscribed,
    Disconnected,
}

/// Why a session stopped. Both outcomes call for a fresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected(String),
    Unauthorized(String),
}

/// Turns reading batches into bus messages.
pub struct Relay {
    base_topic: String,
    publisher: Arc<dyn MessagePublisher>,
}

impl Relay {
    pub fn new(base_topic: impl Into<String>, publisher: Arc<dyn MessagePublisher>) -> Self {
        Self {
            base_topic: base_topic.into(),
            publisher,
        }
    }

    /// Publish one message per circuit, in batch order.
    pub fn publish_batch(&self, batch: &ReadingBatch) {
        debug!(circuits = batch.circuits.len(), "Received data");
        for reading in &batch.circuits {
            match OutboundMessage::from_reading(&self.base_topic, reading) {
                Ok(message) => {
                    debug!(topic = %message.topic, payload = %message.payload, "Published reading");
                    self.publisher.publish(&message.topic, message.payload);
                }
                Err(e) => error!(circuit = %reading.id, error = %e, "Failed to encode reading"),
            }
        }
    }
}

/// One live-feed session: a single channel from connect to disconnect.
///
/// Events are handled one at a time, so transitions follow arrival order.
pub struct FeedSession {
    credential: Credential,
    location: LocationId,
    commands: mpsc::UnboundedSender<ClientEvent>,
    relay: Arc<Relay>,
    state: Arc<watch::Sender<SessionState>>,
}

impl FeedSession {
    pub fn new(
        credential: Credential,
        location: LocationId,
        commands: mpsc::UnboundedSender<ClientEvent>,
        relay: Arc<Relay>,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        state.send_replace(SessionState::Unauthenticated);
        Self {
            credential,
            location,
            commands,
            relay,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            trace!(?previous, ?next, "Session state changed");
        }
    }

    fn send(&self, command: ClientEvent) {
        if self.commands.send(command).is_err() {
            debug!("Live channel already closed; command not sent");
        }
    }

    /// Apply one channel event. Returns the outcome once the session is over.
    pub fn handle_event(&mut self, event: ServerEvent) -> Option<SessionEnd> {
        use SessionState::{Authenticating, Disconnected, Subscribed, Unauthenticated};

        match (self.state(), event) {
            (_, ServerEvent::Disconnected(reason)) => {
                warn!(%reason, "Disconnected from live data channel");
                self.set_state(Disconnected);
                return Some(SessionEnd::Disconnected(reason));
            }
            (_, ServerEvent::Error(message)) => {
                error!(%message, "Live data channel error");
            }
            (Unauthenticated, ServerEvent::Connected) => {
                info!("Connected to live data channel");
                self.send(ClientEvent::Authenticate(self.credential.clone()));
                self.set_state(Authenticating);
            }
            (state, ServerEvent::Connected) => {
                debug!(?state, "Ignoring repeated connect notification");
            }
            (Authenticating, ServerEvent::Authorized) => {
                info!(location_id = %self.location, "Authorized successfully, subscribing");
                self.send(ClientEvent::Subscribe(self.location.clone()));
                self.set_state(Subscribed);
            }
            (Subscribed, ServerEvent::Authorized) => {
                info!("Re-authorized with refreshed token; subscription kept");
            }
            (state, ServerEvent::Authorized) => {
                debug!(?state, "Ignoring unexpected authorization");
            }
            (Disconnected, ServerEvent::Unauthorized(_)) => {}
            (_, ServerEvent::Unauthorized(reason)) => {
                error!(%reason, "Authentication failed");
                self.set_state(Unauthenticated);
                return Some(SessionEnd::Unauthorized(reason));
            }
            (Subscribed, ServerEvent::Data(batch)) => self.relay.publish_batch(&batch),
            (state, ServerEvent::Data(batch)) => {
                debug!(?state, circuits = batch.circuits.len(), "Dropping data received before subscription");
            }
        }
        None
    }

    /// Swap in a refreshed token. While a handshake is underway or complete,
    /// re-send `authenticate` on the same channel; nothing else changes.
    pub fn reauthenticate(&mut self, credential: Credential) {
        if credential == self.credential {
            return;
        }
        self.credential = credential;

        match self.state() {
            SessionState::Authenticating | SessionState::Subscribed => {
                info!("Access token has changed, re-authenticating live channel");
                self.send(ClientEvent::Authenticate(self.credential.clone()));
            }
            state => debug!(?state, "Stored refreshed token for the next handshake"),
        }
    }

    /// Drive the session until the channel ends or authorization is refused.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ServerEvent>,
        mut credentials: watch::Receiver<Option<Credential>>,
    ) -> SessionEnd {
        let mut credentials_open = true;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let event = event.unwrap_or_else(|| {
                        ServerEvent::Disconnected("live channel closed".to_string())
                    });
                    if let Some(end) = self.handle_event(event) {
                        return end;
                    }
                }
                changed = credentials.changed(), if credentials_open => {
                    if changed.is_err() {
                        credentials_open = false;
                        continue;
                    }
                    let latest = credentials.borrow_and_update().clone();
                    if let Some(credential) = latest {
                        self.reauthenticate(credential);
                    }
                }
            }
        }
    }
}
