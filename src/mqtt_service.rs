use crate::config::{Config, ConfigError};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use url::Url;

/// Pause between event-loop polls after a connection error.
const ERROR_POLL_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Fire-and-forget sink for outbound messages.
pub trait MessagePublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: String);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    Error(String),
}

/// Broker endpoint and login derived from the settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Username plus optional password. `None` sends no login at all.
    pub credentials: Option<(String, Option<String>)>,
}

impl BrokerSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| {
            ConfigError::MissingOrInvalid(format!("MQTT_BROKER_URL ({reason})"))
        };

        let url = Url::parse(&config.mqtt_broker_url).map_err(|e| invalid(&e.to_string()))?;
        let (tls, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (false, 1883),
            "mqtts" | "ssl" => (true, 8883),
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();

        let credentials = match (&config.mqtt_username, &config.mqtt_password) {
            (Some(username), password) => Some((username.clone(), password.clone())),
            (None, Some(_)) => {
                warn!("MQTT_PASSWORD is set without MQTT_USERNAME; connecting without credentials.");
                None
            }
            (None, None) => None,
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            tls,
            credentials,
        })
    }

    pub fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(client_id, &self.host, self.port);
        mqtt_options.set_keep_alive(Duration::from_secs(10));
        mqtt_options.set_clean_session(true);

        if self.tls {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        // rumqttc leaves the password flag unset when the password is empty.
        if let Some((username, password)) = &self.credentials {
            mqtt_options.set_credentials(username, password.as_deref().unwrap_or_default());
        }

        mqtt_options
    }
}

/// Long-lived connection to the message bus.
///
/// Reconnection is left to rumqttc: the event loop keeps being polled and
/// re-dials the broker on the next poll after a failure.
pub struct MqttService {
    client: AsyncClient,
    client_state: watch::Sender<ClientState>,
}

impl MqttService {
    /// Create the client and spawn its event loop. Must run inside a tokio runtime.
    pub fn connect(settings: &BrokerSettings, client_id: &str) -> Arc<Self> {
        info!(
            "Configuring MQTT broker at {}:{} (tls: {})...",
            settings.host, settings.port, settings.tls
        );

        let (client, eventloop) =
            AsyncClient::new(settings.mqtt_options(client_id), REQUEST_CHANNEL_CAPACITY);
        let (client_state, _) = watch::channel(ClientState::Disconnected);

        let service = Arc::new(Self {
            client,
            client_state,
        });
        tokio::spawn(service.clone().poll_events(eventloop));
        service
    }

    /// Connection-state notifications.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.client_state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.client_state.borrow() == ClientState::Connected
    }

    async fn poll_events(self: Arc<Self>, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    self.client_state.send_replace(ClientState::Error(e.to_string()));
                    sleep(ERROR_POLL_PAUSE).await;
                }
            }
        }
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("Connected to MQTT broker");
                self.client_state.send_replace(ClientState::Connected);
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("MQTT broker closed the session");
                self.client_state.send_replace(ClientState::Disconnected);
            }
            _ => {
                debug!("Unhandled event: {:?}", event);
            }
        }
    }
}

impl MessagePublisher for MqttService {
    fn publish(&self, topic: &str, payload: String) {
        if !self.is_connected() {
            debug!("MQTT client is not connected; dropping message for '{}'", topic);
            return;
        }

        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            error!("Failed to publish message to '{}': {:?}", topic, e);
        }
    }
}
