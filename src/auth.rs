use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::BridgeError;

/// Bearer access token. Expiry is not tracked locally.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for Credential {}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Source of fresh access tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_access_token(&self) -> Result<Credential, BridgeError>;
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    grant_type: &'static str,
    audience: &'a str,
    username: &'a str,
    password: &'a str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Password-grant exchange against the identity endpoint.
pub struct TokenClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, config: Arc<Config>) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl CredentialProvider for TokenClient {
    async fn fetch_access_token(&self) -> Result<Credential, BridgeError> {
        let grant = PasswordGrant {
            grant_type: "password",
            audience: &self.config.audience,
            username: &self.config.username,
            password: &self.config.password,
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
        };

        debug!(url = %self.config.token_url, "Requesting access token");
        let response = self
            .http
            .post(self.config.token_url.clone())
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .json(&grant)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Auth(format!(
                "identity endpoint returned HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body = response.bytes().await?;
        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| BridgeError::Auth(format!("malformed token response: {e}")))?;

        info!("Access token fetched successfully");
        Ok(Credential::new(token.access_token))
    }
}
