//! Caller-facing side of the client.
//!
//! A [`HassHandle`] never touches connection state directly: it queues a
//! [`Command`] for the reader task and waits on a oneshot slot that the
//! correlator fills when the matching reply arrives.

use hass_ws_protocol::{Event, Request, ServiceCall};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::correlator::ReplySender;
use crate::error::{ClientError, ClientResult};

/// A request queued for the reader task.
#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) request: Request,
    pub(crate) reply: ReplySender,
}

impl Command {
    /// Fail the command without sending it.
    pub(crate) fn reject(self, err: ClientError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Notifications emitted by the client, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Auth succeeded on a fresh connection.
    Authenticated { ha_version: Option<String> },
    /// An event arrived on one of the subscriptions.
    Event(Event),
    /// The connection ended; pending requests have been canceled.
    Disconnected,
}

/// Cloneable handle for sending requests over the current connection.
///
/// Requests issued while no authenticated connection exists wait until
/// one is established. Requests in flight when the connection drops fail
/// with [`ClientError::Canceled`].
#[derive(Debug, Clone)]
pub struct HassHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl HassHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Send a request and wait for its reply.
    ///
    /// Returns the `result` field of a successful reply (or `null`).
    pub async fn send(&self, request: Request) -> ClientResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { request, reply })
            .map_err(|_| ClientError::Shutdown)?;

        rx.await.unwrap_or(Err(ClientError::Canceled))
    }

    /// Fetch every entity state.
    pub async fn get_states(&self) -> ClientResult<Vec<Value>> {
        match self.send(Request::GetStates).await? {
            Value::Array(states) => Ok(states),
            Value::Null => Ok(Vec::new()),
            other => Err(ClientError::command_failed(
                "invalid_result",
                format!("get_states returned {}", json_kind(&other)),
            )),
        }
    }

    /// Invoke a service on one entity.
    pub async fn call_service(&self, call: ServiceCall) -> ClientResult<Value> {
        self.send(call.into()).await
    }

    /// Add an extra subscription on the current connection.
    ///
    /// Subscriptions made this way are not restored after a reconnect;
    /// configure [`ClientConfig::with_event_types`](crate::ClientConfig::with_event_types)
    /// for that.
    pub async fn subscribe_events(&self, event_type: Option<String>) -> ClientResult<Value> {
        self.send(Request::SubscribeEvents { event_type }).await
    }

    /// Round-trip a ping.
    pub async fn ping(&self) -> ClientResult<()> {
        self.send(Request::Ping).await.map(|_| ())
    }

    /// `true` once the client task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
