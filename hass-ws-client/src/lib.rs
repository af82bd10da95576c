//! Home Assistant WebSocket Client
//!
//! Reconnecting client for the Home Assistant WebSocket API
//! (`/api/websocket`).
//!
//! ## Overview
//!
//! - **Framing**: [`JsonStream`] splits an arbitrary byte stream into
//!   complete JSON values
//! - **Handshake**: `auth_required` → `auth` → `auth_ok` / `auth_invalid`,
//!   then the configured `subscribe_events` on every new connection
//! - **Correlation**: any number of concurrent requests through a cloneable
//!   [`HassHandle`], matched to replies by id
//! - **Reconnection**: [`HassClient::run`] retries forever with backoff
//!   (500ms, 1s, 2s, 4s, 8s) until its cancellation token fires
//!
//! All per-connection state is owned by the single task running
//! [`HassClient::run`]. Handles talk to it only through a command queue
//! and oneshot reply slots.
//!
//! ## Usage
//!
//! ```no_run
//! use hass_ws_client::{ClientConfig, ClientEvent, HassClient, ServiceCall};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::for_host("homeassistant.local", "long-lived-token");
//!     let (client, handle, mut events) = HassClient::new(config);
//!
//!     let cancel = CancellationToken::new();
//!     tokio::spawn(client.run(cancel.clone()));
//!
//!     while let Some(event) = events.recv().await {
//!         if let ClientEvent::Authenticated { .. } = event {
//!             handle
//!                 .call_service(ServiceCall::new("light", "turn_on", "light.kitchen"))
//!                 .await?;
//!             break;
//!         }
//!     }
//!
//!     cancel.cancel();
//!     Ok(())
//! }
//! ```

pub mod config;
pub(crate) mod correlator;
pub mod decoder;
pub mod error;
pub mod handle;
pub mod session;
pub mod supervisor;

// Re-export main types for convenience
pub use config::{websocket_url, ClientConfig};
pub use decoder::{FrameError, JsonStream};
pub use error::{ClientError, ClientResult};
pub use handle::{ClientEvent, HassHandle};
pub use session::ConnectionState;
pub use supervisor::HassClient;

pub use hass_ws_protocol::{Event, Request, ServiceCall};
