//! Error types for the Home Assistant WebSocket client

use crate::decoder::FrameError;
use crate::session::ConnectionState;
use thiserror::Error;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport could not be opened
    #[error("Connection failed to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Server rejected the access token
    #[error("Authentication rejected by Home Assistant: {message}")]
    AuthInvalid { message: String },

    /// Connection closed before the reply arrived
    #[error("Request canceled: connection closed before a reply arrived")]
    Canceled,

    /// Client task has stopped for good
    #[error("Client has shut down")]
    Shutdown,

    /// Server answered with `success: false`
    #[error("Command failed (code {code}): {message}")]
    CommandFailed { code: String, message: String },

    /// Message not valid in the current connection state
    #[error("Protocol error: unexpected '{kind}' while {state}")]
    Protocol {
        state: ConnectionState,
        kind: String,
    },

    /// Byte stream did not contain valid JSON
    #[error("Malformed JSON stream: {0}")]
    Frame(#[from] FrameError),

    /// Keepalive ping was not answered in time
    #[error("Keepalive ping {id} was not answered")]
    KeepaliveTimeout { id: u64 },

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Create an authentication error
    pub fn auth_invalid(message: impl Into<String>) -> Self {
        Self::AuthInvalid {
            message: message.into(),
        }
    }

    /// Create a command failure from a server error reply
    pub fn command_failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a protocol violation error
    pub fn protocol(state: ConnectionState, kind: impl Into<String>) -> Self {
        Self::Protocol {
            state,
            kind: kind.into(),
        }
    }

    /// `true` when the request never got an answer because the connection
    /// (or the whole client) went away.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::Shutdown)
    }

    /// `true` for authentication failures.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthInvalid { .. })
    }
}
