//! Relay Curb live circuit readings to an MQTT broker.
//!
//! The [`supervisor::Supervisor`] fetches a token, resolves the monitored
//! location, opens the live channel and runs a [`session::FeedSession`] that
//! publishes each circuit reading under `<MQTT_TOPIC>/<circuit id>`.

pub mod auth;
pub mod config;
pub mod error;
pub mod live_feed;
pub mod location;
pub mod models;
pub mod mqtt_service;
pub mod service_utils;
pub mod session;
pub mod socketio;
pub mod supervisor;

pub use error::BridgeError;
