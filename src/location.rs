use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use tracing::info;

use crate::auth::Credential;
use crate::config::Config;
use crate::error::BridgeError;
use crate::models::{Location, LocationId};

/// Looks up the site whose circuits are relayed.
#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn resolve_location(&self, credential: &Credential) -> Result<LocationId, BridgeError>;
}

/// Vendor account API client.
///
/// Always picks the first location the account lists; accounts with several
/// sites only ever relay the first one.
pub struct AccountClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl AccountClient {
    pub fn new(http: reqwest::Client, config: Arc<Config>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl LocationResolver for AccountClient {
    async fn resolve_location(&self, credential: &Credential) -> Result<LocationId, BridgeError> {
        let response = self
            .http
            .get(self.config.locations_url.clone())
            .bearer_auth(credential.expose())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BridgeError::Auth(format!(
                "location lookup rejected the token (HTTP {})",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let locations: Vec<Location> =
            serde_json::from_slice(&body).map_err(|e| BridgeError::Decode {
                context: "location list",
                message: e.to_string(),
            })?;

        let location = locations
            .into_iter()
            .next()
            .ok_or(BridgeError::NoLocation)?;

        info!(location_id = %location.id, "Location ID fetched successfully");
        Ok(location.id)
    }
}
