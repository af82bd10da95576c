//! Home Assistant ↔ MQTT gateway
//!
//! Mirrors Home Assistant entity state onto MQTT and turns MQTT messages
//! into Home Assistant service calls:
//! - **Outbound**: every `state_changed` event (and a full `get_states`
//!   snapshot after each authentication) is published retained to
//!   `<root>/<entity_id>/state`
//! - **Inbound**: a message on `<root>/<entity_id>/<domain>.<service>`
//!   calls that service on that entity, with the JSON payload as data
//! - **Connectivity**: `<root>/connected` carries `"1"` while Home
//!   Assistant is reachable, `"0"` otherwise (also the MQTT last will)
//!
//! The Home Assistant side is [`hass_ws_client`]; the MQTT side is
//! `rumqttc`. [`Gateway`] joins the two on a single task.

pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mqtt;
pub mod topics;

// Re-export main types for convenience
pub use bridge::{CommandRejection, Publication};
pub use config::{Cli, GatewayConfig, MqttConfig};
pub use error::{GatewayError, GatewayResult};
pub use gateway::Gateway;
pub use mqtt::{MqttEvent, MqttLink, Publish};
pub use topics::Topics;
