use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::{Config, ConfigError};
use crate::mqtt_service::{BrokerSettings, MqttService};

/// Initialise logging. `debug` raises the default level; `RUST_LOG` wins when set.
pub fn start_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        error!("Logging was already initialised");
    }
}

/// Start the MQTT service
pub fn start_mqtt_service(config: &Config) -> Result<Arc<MqttService>, ConfigError> {
    let settings = BrokerSettings::from_config(config)?;
    let mqtt_client_id = format!("curb_bridge_{}", Uuid::new_v4());
    Ok(MqttService::connect(&settings, &mqtt_client_id))
}

/// Wait for Ctrl-C.
pub async fn handle_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        std::future::pending::<()>().await;
    }
    info!("Bridge is shutting down...");
}
