use thiserror::Error;

use crate::config::ConfigError;

/// Failure modes of the bridge's network-facing components.
///
/// A transport disconnect is not listed here: it ends a live session
/// normally and is reported as [`crate::session::SessionEnd::Disconnected`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Credential rejected, or the token exchange returned something unusable.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The account has no registered locations.
    #[error("No locations found for this account")]
    NoLocation,

    /// The vendor API answered with a status we do not handle.
    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// Response body could not be decoded.
    #[error("Failed to decode {context}: {message}")]
    Decode { context: &'static str, message: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Live channel fault (connect failure, bad frame, heartbeat loss).
    #[error("Live channel error: {0}")]
    Transport(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Returns `true` when the failure came from a rejected credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}
