//! Client configuration.

use std::time::Duration;

/// Port Home Assistant listens on when the host string carries none.
pub const DEFAULT_PORT: u16 = 8123;

/// Path of the WebSocket API endpoint.
pub const API_PATH: &str = "/api/websocket";

/// Configuration for a [`HassClient`](crate::HassClient).
///
/// # Example
///
/// ```rust
/// use hass_ws_client::ClientConfig;
///
/// let config = ClientConfig::new("ws://homeassistant.local:8123/api/websocket", "token")
///     .with_event_types(["state_changed"])
///     .with_keepalive_ms(30_000);
/// assert_eq!(config.event_types(), ["state_changed"]);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the API endpoint.
    url: String,
    /// Long-lived access token.
    access_token: String,
    /// Event types to subscribe to after auth. Empty means "all events".
    event_types: Vec<String>,
    /// Keepalive ping interval (default: 30 s, `None` disables).
    keepalive_interval: Option<Duration>,
    /// Timeout for opening the transport (default: 10 s).
    connect_timeout: Duration,
    /// Cap on bytes buffered for one incomplete JSON value.
    max_frame_buffer: usize,
}

impl ClientConfig {
    /// Create a config for the given endpoint URL and access token.
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
            event_types: Vec::new(),
            keepalive_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            max_frame_buffer: crate::decoder::DEFAULT_MAX_BUFFER,
        }
    }

    /// Create a config from a bare host (`host` or `host:port`).
    pub fn for_host(host: &str, access_token: impl Into<String>) -> Self {
        Self::new(websocket_url(host), access_token)
    }

    /// Subscribe to these event types after every successful auth.
    ///
    /// Leave empty (the default) to subscribe to all events.
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the keepalive ping interval in milliseconds. `0` disables pings.
    pub fn with_keepalive_ms(mut self, ms: u64) -> Self {
        self.keepalive_interval = (ms > 0).then(|| Duration::from_millis(ms));
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_buffer(mut self, bytes: usize) -> Self {
        self.max_frame_buffer = bytes;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn event_types(&self) -> &[String] {
        &self.event_types
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn max_frame_buffer(&self) -> usize {
        self.max_frame_buffer
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("access_token", &"<redacted>")
            .field("event_types", &self.event_types)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_frame_buffer", &self.max_frame_buffer)
            .finish()
    }
}

/// Build the API endpoint URL from a host string.
///
/// `ws://` and `wss://` URLs are taken as they are; a bare host gets the
/// default port and the API path. IPv6 addresses may be given bare
/// (`::1`) or bracketed (`[::1]`, `[::1]:8123`).
pub fn websocket_url(host: &str) -> String {
    if host.starts_with("ws://") || host.starts_with("wss://") {
        return host.to_string();
    }

    let host = host.trim_end_matches('/');
    let has_port = match host.strip_prefix('[') {
        Some(bracketed) => bracketed.contains("]:"),
        None if host.matches(':').count() > 1 => {
            return format!("ws://[{host}]:{DEFAULT_PORT}{API_PATH}");
        }
        None => host.contains(':'),
    };

    if has_port {
        format!("ws://{host}{API_PATH}")
    } else {
        format!("ws://{host}:{DEFAULT_PORT}{API_PATH}")
    }
}
