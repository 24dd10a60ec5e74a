use curb_bridge::auth::TokenClient;
use curb_bridge::config::Config;
use curb_bridge::live_feed::SocketIoConnector;
use curb_bridge::location::AccountClient;
use curb_bridge::service_utils::{handle_shutdown, start_logging, start_mqtt_service};
use curb_bridge::session::Relay;
use curb_bridge::supervisor::Supervisor;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            start_logging(false);
            error!("Error loading configuration: {}", e);
            return;
        }
    };

    start_logging(config.debug);
    info!("Starting Curb bridge...");

    let mqtt_service = match start_mqtt_service(&config) {
        Ok(service) => service,
        Err(e) => {
            error!("Invalid MQTT settings: {}", e);
            return;
        }
    };

    let http = reqwest::Client::new();
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(TokenClient::new(http.clone(), config.clone())),
        Arc::new(AccountClient::new(http, config.clone())),
        Arc::new(SocketIoConnector::new(config.live_data_url.clone())),
        Arc::new(Relay::new(config.mqtt_topic.clone(), mqtt_service)),
        config.reconnect_delay(),
        config.token_refresh_interval(),
    ));

    tokio::select! {
        () = supervisor.run() => {}
        () = handle_shutdown() => {}
    }

    info!("Bridge stopped.");
}
