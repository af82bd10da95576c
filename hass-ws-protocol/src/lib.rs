//! # hass-ws-protocol
//!
//! Wire protocol types for the Home Assistant WebSocket API, shared by
//! `hass-ws-client` (the connection itself) and `ha-mqtt-gateway` (which
//! builds service calls and reads events).
//!
//! # Wire Protocol
//!
//! All messages are JSON objects with a `"type"` discriminant tag.
//!
//! ## Server → Client ([`ServerMessage`])
//!
//! - `auth_required`: first message on every connection
//! - `auth_ok` / `auth_invalid`: answer to the `auth` message
//! - `event`: delivery for an active `subscribe_events` subscription
//! - `result`: reply to a request, correlated by `id`
//! - `pong`: reply to a `ping`, correlated by `id`
//!
//! ## Client → Server
//!
//! - [`AuthRequest`]: `auth`, the only message sent without an `id`
//! - [`Request`]: every other command, wrapped in an [`Envelope`] that
//!   carries the correlation `id`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ════════════════════════════════════════════════════════════════════
// Server → Client
// ════════════════════════════════════════════════════════════════════

/// A message sent by Home Assistant to a connected client.
///
/// Decoding into this closed set up front means an unrecognised `type`
/// fails at the serde boundary instead of deep inside the dispatcher.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server wants credentials before anything else.
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },

    /// Credentials accepted.
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },

    /// Credentials rejected. The server closes the socket afterwards.
    AuthInvalid {
        #[serde(default)]
        message: String,
    },

    /// Event delivery. `id` is the id of the `subscribe_events` request.
    Event {
        #[serde(default)]
        id: Option<u64>,
        event: Event,
    },

    /// Reply to a request.
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },

    /// Reply to a `ping`.
    Pong { id: u64 },
}

impl ServerMessage {
    /// Every `type` tag this enum understands.
    pub const KINDS: [&'static str; 6] = [
        "auth_required",
        "auth_ok",
        "auth_invalid",
        "event",
        "result",
        "pong",
    ];

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AuthRequired { .. } => "auth_required",
            ServerMessage::AuthOk { .. } => "auth_ok",
            ServerMessage::AuthInvalid { .. } => "auth_invalid",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Result { .. } => "result",
            ServerMessage::Pong { .. } => "pong",
        }
    }
}

/// Error detail carried by a failed `result`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// A bus event as delivered inside an `event` message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub time_fired: Option<String>,
}

// ════════════════════════════════════════════════════════════════════
// Client → Server
// ════════════════════════════════════════════════════════════════════

/// The authentication message, sent in reply to `auth_required`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename = "auth")]
pub struct AuthRequest {
    pub access_token: String,
}

impl AuthRequest {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
        }
    }
}

/// A command sent by the client. The `id` is added by [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Subscribe to one event type, or to all events when `event_type` is `None`.
    SubscribeEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
    },

    /// Fetch every current entity state.
    GetStates,

    /// Invoke `domain.service`.
    CallService {
        domain: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        service_data: Option<Value>,
    },

    /// Keepalive.
    Ping,
}

impl Request {
    /// The wire `type` tag of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::SubscribeEvents { .. } => "subscribe_events",
            Request::GetStates => "get_states",
            Request::CallService { .. } => "call_service",
            Request::Ping => "ping",
        }
    }
}

/// A [`Request`] with its correlation id, as it goes on the wire.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub request: &'a Request,
}

impl<'a> Envelope<'a> {
    pub fn new(id: u64, request: &'a Request) -> Self {
        Self { id, request }
    }
}

/// A `domain.service` invocation aimed at a single entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    pub data: Map<String, Value>,
}

impl ServiceCall {
    pub fn new(
        domain: impl Into<String>,
        service: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            entity_id: entity_id.into(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

impl From<ServiceCall> for Request {
    fn from(call: ServiceCall) -> Self {
        let mut target = Map::new();
        target.insert("entity_id".to_string(), Value::String(call.entity_id));

        Request::CallService {
            domain: call.domain,
            service: call.service,
            target: Some(Value::Object(target)),
            service_data: Some(Value::Object(call.data)),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════
