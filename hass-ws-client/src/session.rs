//! One connection: the auth handshake and steady-state message routing.
//!
//! A [`Session`] is created for every transport the supervisor opens and
//! dropped when that transport ends. It is the only owner of the
//! per-connection state (decoder buffer, pending requests and auth
//! status), so nothing can leak from one connection into the next.
//!
//! ```text
//!  Connected ──auth_required──▶ AuthRequired ──auth_ok──────▶ AuthOk
//!                                    │                          │ event  → ClientEvent::Event
//!                                    └──auth_invalid─▶ AuthInvalid      result → Correlator
//! ```

use std::fmt;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hass_ws_protocol::{AuthRequest, Envelope, Request, ServerMessage};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::correlator::{Completion, Correlator, Pending};
use crate::decoder::JsonStream;
use crate::error::{ClientError, ClientResult};
use crate::handle::{ClientEvent, Command};

/// How long to wait for the close handshake before giving up on it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// ════════════════════════════════════════════════════════════════════
// State
// ════════════════════════════════════════════════════════════════════

/// Authentication state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, nothing exchanged yet.
    Connected,
    /// Credentials sent, waiting for the verdict.
    AuthRequired,
    /// Steady state.
    AuthOk,
    /// Credentials rejected. Terminal for this connection.
    AuthInvalid,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::AuthRequired => "awaiting authentication",
            ConnectionState::AuthOk => "authenticated",
            ConnectionState::AuthInvalid => "authentication rejected",
        };
        f.write_str(text)
    }
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Server closed the transport.
    Closed,
    /// External shutdown.
    Canceled,
}

// ════════════════════════════════════════════════════════════════════
// Session
// ════════════════════════════════════════════════════════════════════

pub(crate) struct Session<'a, S> {
    ws: S,
    config: &'a ClientConfig,
    events: &'a mpsc::UnboundedSender<ClientEvent>,
    state: ConnectionState,
    decoder: JsonStream,
    correlator: Correlator,
    auth_failure: Option<String>,
    /// Id of the last keepalive ping sent.
    keepalive_ping: Option<u64>,
    authenticated: bool,
}

impl<'a, S> Session<'a, S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    pub(crate) fn new(
        ws: S,
        config: &'a ClientConfig,
        events: &'a mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            ws,
            config,
            events,
            state: ConnectionState::Connected,
            decoder: JsonStream::with_max_buffer(config.max_frame_buffer()),
            correlator: Correlator::new(),
            auth_failure: None,
            keepalive_ping: None,
            authenticated: false,
        }
    }

    /// `true` if this session got as far as `auth_ok`.
    pub(crate) fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Drive the connection until it closes, fails or is canceled.
    ///
    /// Cleanup (pending cancellation, decoder reset, transport close) runs
    /// on every exit path before this returns.
    pub(crate) async fn run(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> ClientResult<SessionEnd> {
        let result = self.drive(commands, cancel).await;
        self.finish(commands).await;
        result
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> ClientResult<SessionEnd> {
        let mut keepalive = self.config.keepalive_interval().map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut commands_open = true;

        loop {
            let authenticated = self.state == ConnectionState::AuthOk;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(SessionEnd::Canceled),

                frame = self.ws.next() => match frame {
                    None => return Ok(SessionEnd::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(message)) => {
                        if self.on_frame(message).await? {
                            return Ok(SessionEnd::Closed);
                        }
                    }
                },

                command = commands.recv(), if authenticated && commands_open => match command {
                    Some(command) => self.submit(command).await?,
                    None => commands_open = false,
                },

                _ = tick(&mut keepalive), if authenticated => self.keepalive().await?,
            }
        }
    }

    /// Feed one transport message through the decoder and dispatch every
    /// complete value. Returns `true` on a close frame.
    async fn on_frame(&mut self, message: Message) -> ClientResult<bool> {
        match &message {
            Message::Text(text) => self.decoder.feed(text.as_str().as_bytes()),
            Message::Binary(data) => self.decoder.feed(&data[..]),
            Message::Close(_frame) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Home Assistant closed the connection: {:?}", _frame);
                return Ok(true);
            }
            // Control frames are answered by tungstenite itself.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(false),
        }

        while let Some(value) = self.decoder.next_value() {
            let message = decode_message(self.state, value?)?;
            self.dispatch(message).await?;
        }

        Ok(false)
    }

    async fn dispatch(&mut self, message: ServerMessage) -> ClientResult<()> {
        use ConnectionState::*;

        match (self.state, message) {
            (Connected, ServerMessage::AuthRequired { ha_version: _version }) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Auth required by Home Assistant {:?}", _version);

                let auth = AuthRequest::new(self.config.access_token());
                self.send_json(&auth).await?;
                self.state = AuthRequired;
            }

            (AuthRequired, ServerMessage::AuthOk { ha_version }) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Authenticated with Home Assistant {:?}", ha_version);

                self.state = AuthOk;
                self.authenticated = true;
                let _ = self.events.send(ClientEvent::Authenticated { ha_version });
                self.subscribe_all().await?;
            }

            (AuthRequired, ServerMessage::AuthInvalid { message }) => {
                self.state = AuthInvalid;
                self.auth_failure = Some(message.clone());
                return Err(ClientError::auth_invalid(message));
            }

            (AuthOk, ServerMessage::Event { event, .. }) => {
                let _ = self.events.send(ClientEvent::Event(event));
            }

            (
                AuthOk,
                ServerMessage::Result {
                    id,
                    success,
                    result,
                    error,
                },
            ) => {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    let error = error.unwrap_or_default();
                    Err(ClientError::command_failed(error.code, error.message))
                };
                self.complete(id, outcome);
            }

            (AuthOk, ServerMessage::Pong { id }) => self.complete(id, Ok(Value::Null)),

            (state, message) => return Err(ClientError::protocol(state, message.kind())),
        }

        Ok(())
    }

    fn complete(&mut self, id: u64, outcome: ClientResult<Value>) {
        match self.correlator.complete(id, outcome) {
            Completion::Delivered => {}
            Completion::Subscription {
                event_type: _event_type,
                accepted: true,
            } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Subscribed to {}",
                    _event_type.as_deref().unwrap_or("all events")
                );
            }
            Completion::Subscription {
                event_type: _event_type,
                accepted: false,
            } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Home Assistant refused subscription to {}",
                    _event_type.as_deref().unwrap_or("all events")
                );
            }
            Completion::Keepalive => self.keepalive_ping = None,
            Completion::Unknown => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Ignoring reply {} with no pending request", id);
            }
        }
    }

    /// Issue the configured subscriptions. Runs once per authenticated
    /// connection; the acknowledgements come back through the correlator.
    async fn subscribe_all(&mut self) -> ClientResult<()> {
        let filters: Vec<Option<String>> = if self.config.event_types().is_empty() {
            vec![None]
        } else {
            self.config.event_types().iter().cloned().map(Some).collect()
        };

        for event_type in filters {
            let request = Request::SubscribeEvents {
                event_type: event_type.clone(),
            };
            let id = self.correlator.register(Pending::Subscription { event_type });
            self.send_request(id, &request).await?;
        }

        Ok(())
    }

    async fn submit(&mut self, command: Command) -> ClientResult<()> {
        if command.reply.is_closed() {
            // Caller stopped waiting before we got to it.
            return Ok(());
        }

        let Command { request, reply } = command;
        let id = self.correlator.register(Pending::Caller(reply));
        self.send_request(id, &request).await
    }

    async fn keepalive(&mut self) -> ClientResult<()> {
        if let Some(id) = self.keepalive_ping {
            if self.correlator.is_pending(id) {
                return Err(ClientError::KeepaliveTimeout { id });
            }
        }

        let id = self.correlator.register(Pending::Keepalive);
        self.keepalive_ping = Some(id);
        self.send_request(id, &Request::Ping).await
    }

    async fn send_request(&mut self, id: u64, request: &Request) -> ClientResult<()> {
        #[cfg(feature = "tracing")]
        tracing::trace!("Sending {} request {}", request.kind(), id);

        self.send_json(&Envelope::new(id, request)).await
    }

    async fn send_json<T: Serialize>(&mut self, message: &T) -> ClientResult<()> {
        let text = serde_json::to_string(message)?;
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Exit path shared by every way out of [`drive`](Self::drive).
    async fn finish(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        let _canceled = match &self.auth_failure {
            Some(message) => {
                let canceled = self
                    .correlator
                    .cancel_all(|| ClientError::auth_invalid(message));
                while let Ok(command) = commands.try_recv() {
                    command.reject(ClientError::auth_invalid(message));
                }
                canceled
            }
            None => self.correlator.cancel_all(|| ClientError::Canceled),
        };

        let _discarded = self.decoder.close();
        self.keepalive_ping = None;

        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close()).await;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Session closed in state '{}': {} request(s) canceled, {} byte(s) discarded",
            self.state,
            _canceled,
            _discarded
        );
    }
}

/// Decode one JSON value into the closed message set.
///
/// An unknown `type` is reported as a protocol violation; a known type
/// with the wrong shape keeps the serde error.
fn decode_message(state: ConnectionState, value: Value) -> ClientResult<ServerMessage> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned);

    serde_json::from_value(value).map_err(|e| match kind {
        Some(kind) if !ServerMessage::KINDS.contains(&kind.as_str()) => {
            ClientError::protocol(state, kind)
        }
        None => ClientError::protocol(state, "<untyped value>"),
        Some(_) => ClientError::Json(e),
    })
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════
