//! Reconnection supervisor.
//!
//! [`HassClient::run`] opens a transport, drives one [`Session`] to
//! completion and starts over, until the cancellation token fires. Each
//! session starts from scratch: fresh decoder, ids from 1, empty pending
//! table, full resubscription.

use std::sync::Once;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::handle::{ClientEvent, Command, HassHandle};
use crate::session::{Session, SessionEnd};

/// Delay before reconnect attempt N (ms). The last entry repeats.
const BACKOFF_MS: [u64; 5] = [500, 1_000, 2_000, 4_000, 8_000];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnecting Home Assistant client.
///
/// Created together with a [`HassHandle`] for issuing requests and a
/// receiver for [`ClientEvent`]s. Nothing happens until [`run`](Self::run)
/// is awaited (usually in its own task).
///
/// ```rust,no_run
/// use hass_ws_client::{ClientConfig, ClientEvent, HassClient};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() {
/// let config = ClientConfig::for_host("homeassistant.local", "token")
///     .with_event_types(["state_changed"]);
/// let (client, handle, mut events) = HassClient::new(config);
///
/// let cancel = CancellationToken::new();
/// tokio::spawn(client.run(cancel.clone()));
///
/// while let Some(event) = events.recv().await {
///     if let ClientEvent::Authenticated { .. } = event {
///         let states = handle.get_states().await.unwrap_or_default();
///         println!("{} entities", states.len());
///     }
/// }
/// # }
/// ```
pub struct HassClient {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl HassClient {
    pub fn new(config: ClientConfig) -> (Self, HassHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();

        let client = Self {
            config,
            commands,
            events,
        };
        (client, HassHandle::new(command_tx), event_rx)
    }

    /// Run connection attempts until `cancel` fires.
    ///
    /// Cancellation is the only way out and is not an error. Every
    /// [`HassHandle`] request still queued at that point fails with
    /// [`ClientError::Shutdown`], and the event receiver sees the end of
    /// the stream.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut attempt = 0usize;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let ws = match self.connect(&cancel).await {
                Ok(Some(ws)) => ws,
                Ok(None) => break,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("{}", _e);

                    if !self.backoff(&mut attempt, None, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            #[cfg(feature = "tracing")]
            tracing::info!("Connected to {}", self.config.url());

            let mut session = Session::new(ws, &self.config, &self.events);
            let outcome = session.run(&mut self.commands, &cancel).await;
            let authenticated = session.authenticated();
            drop(session);

            let _ = self.events.send(ClientEvent::Disconnected);

            let auth_failure = match outcome {
                Ok(SessionEnd::Canceled) => break,
                Ok(SessionEnd::Closed) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Home Assistant connection closed, reconnecting");
                    None
                }
                Err(ClientError::AuthInvalid { message }) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        "Home Assistant rejected the access token ({}). Check the token file; retrying",
                        message
                    );
                    Some(message)
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Home Assistant connection lost: {}", _e);
                    None
                }
            };

            if authenticated {
                attempt = 0;
                continue;
            }

            if !self
                .backoff(&mut attempt, auth_failure.as_deref(), &cancel)
                .await
            {
                break;
            }
        }

        self.shutdown();
    }

    /// Open the transport. `Ok(None)` means canceled while connecting.
    async fn connect(&self, cancel: &CancellationToken) -> ClientResult<Option<WsStream>> {
        let url = self.config.url();
        let timeout = self.config.connect_timeout();

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = tokio::time::timeout(timeout, open(url)) => {
                match result {
                    Ok(Ok(ws)) => Ok(Some(ws)),
                    Ok(Err(e)) => Err(ClientError::connection_failed(url, e.to_string())),
                    Err(_) => Err(ClientError::connection_failed(
                        url,
                        format!("timed out after {:?}", timeout),
                    )),
                }
            }
        }
    }

    /// Wait out the next backoff step. Returns `false` if canceled.
    ///
    /// While waiting after an auth failure, new requests fail immediately
    /// instead of queueing behind a token that is known to be bad.
    async fn backoff(
        &mut self,
        attempt: &mut usize,
        auth_failure: Option<&str>,
        cancel: &CancellationToken,
    ) -> bool {
        let delay_ms = backoff_delay(*attempt);
        *attempt += 1;

        #[cfg(feature = "tracing")]
        tracing::info!("Reconnecting in {}ms (attempt {})", delay_ms, *attempt);

        let sleep = tokio::time::sleep(Duration::from_millis(delay_ms));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv(), if auth_failure.is_some() => {
                    command.reject(ClientError::auth_invalid(auth_failure.unwrap_or_default()));
                }
            }
        }
    }

    fn shutdown(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(ClientError::Shutdown);
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Home Assistant client stopped");
    }
}

/// Open the WebSocket, with a TLS handshake first for `wss://`.
async fn open(url: &str) -> Result<WsStream, WsError> {
    if url.starts_with("wss://") {
        install_crypto_provider();
    }
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws)
}

fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Fails only if the process already installed one, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn backoff_delay(attempt: usize) -> u64 {
    BACKOFF_MS
        .get(attempt)
        .copied()
        .unwrap_or(BACKOFF_MS[BACKOFF_MS.len() - 1])
}
