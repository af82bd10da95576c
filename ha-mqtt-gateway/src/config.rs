//! Command-line and token-file configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hass_ws_client::ClientConfig;

use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_ROOT_TOPIC: &str = "ha-mqtt-gateway";

/// Bridge Home Assistant entity states and service calls to MQTT
#[derive(Debug, Parser)]
#[command(name = "ha-mqtt-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Home Assistant host (`host`, `host:port`, `[ipv6]:port` or a ws:// or wss:// URL)
    #[arg(value_name = "HOST")]
    pub host: String,

    /// MQTT broker host
    #[arg(short = 'H', long, default_value = "127.0.0.1", value_name = "HOST")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT username
    #[arg(short = 'u', long)]
    pub mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// File with the Home Assistant long-lived access token (first line)
    #[arg(short = 'f', long, value_name = "TOKEN_FILE")]
    pub token_file: PathBuf,

    /// Root of every MQTT topic the gateway uses
    #[arg(short = 'r', long, default_value = DEFAULT_ROOT_TOPIC)]
    pub root_topic: String,

    /// MQTT client id (defaults to the root topic)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Home Assistant event type to subscribe to (repeatable)
    #[arg(short = 'e', long = "event", value_name = "EVENT_TYPE", default_value = "state_changed")]
    pub events: Vec<String>,

    /// Home Assistant keepalive ping interval in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    pub keepalive_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// MQTT connection settings.
#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.credentials.as_ref().map(|(user, _)| user))
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Everything the gateway needs to start.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub hass: ClientConfig,
    pub mqtt: MqttConfig,
    pub root_topic: String,
}

impl GatewayConfig {
    /// Validate the command line and load the token file.
    pub fn from_cli(cli: &Cli) -> GatewayResult<Self> {
        let root_topic = validate_root_topic(&cli.root_topic)?;
        let token = read_token(&cli.token_file)?;

        let events: Vec<&str> = cli
            .events
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .collect();

        let hass = ClientConfig::for_host(&cli.host, token)
            .with_event_types(events)
            .with_keepalive_ms(cli.keepalive_secs.saturating_mul(1_000));

        let credentials = cli.mqtt_username.as_ref().map(|user| {
            (
                user.clone(),
                cli.mqtt_password.clone().unwrap_or_default(),
            )
        });

        let mqtt = MqttConfig {
            host: cli.mqtt_host.clone(),
            port: cli.mqtt_port,
            client_id: cli.client_id.clone().unwrap_or_else(|| root_topic.clone()),
            credentials,
            keep_alive: Duration::from_secs(30),
        };

        Ok(Self {
            hass,
            mqtt,
            root_topic,
        })
    }
}

/// Read the access token: first line of the file, trimmed.
pub fn read_token(path: &Path) -> GatewayResult<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read token file {}", path.display()))?;

    let token = contents.lines().next().unwrap_or_default().trim();
    if token.is_empty() {
        return Err(GatewayError::config(format!(
            "token file {} is empty",
            path.display()
        )));
    }
    Ok(token.to_string())
}

fn validate_root_topic(root: &str) -> GatewayResult<String> {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return Err(GatewayError::config("root topic must not be empty"));
    }
    if root.contains(['+', '#']) {
        return Err(GatewayError::config(format!(
            "root topic '{root}' must not contain MQTT wildcards"
        )));
    }
    Ok(root.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn token_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ha-mqtt-gateway").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn token_is_first_line_trimmed() {
        let file = token_file("  abc.def  \nsecond line\n");
        assert_eq!(read_token(file.path()).unwrap(), "abc.def");
    }

    #[test]
    fn empty_token_is_rejected() {
        let file = token_file("\n\n");
        assert!(matches!(
            read_token(file.path()),
            Err(GatewayError::Config { .. })
        ));
    }

    #[test]
    fn missing_token_file_is_an_error() {
        let err = read_token(Path::new("/nonexistent/ha-token")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ha-token"));
    }

    #[test]
    fn defaults() {
        let file = token_file("secret\n");
        let path = file.path().to_str().unwrap();
        let cli = parse(&["homeassistant.local", "-f", path]);
        let config = GatewayConfig::from_cli(&cli).unwrap();

        assert_eq!(
            config.hass.url(),
            "ws://homeassistant.local:8123/api/websocket"
        );
        assert_eq!(config.hass.access_token(), "secret");
        assert_eq!(config.hass.event_types(), ["state_changed"]);
        assert_eq!(
            config.hass.keepalive_interval(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.root_topic, "ha-mqtt-gateway");
        assert_eq!(config.mqtt.host, "127.0.0.1");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.client_id, "ha-mqtt-gateway");
        assert!(config.mqtt.credentials.is_none());
    }

    #[test]
    fn explicit_options() {
        let file = token_file("secret");
        let path = file.path().to_str().unwrap();
        let cli = parse(&[
            "10.0.0.2:9000",
            "-f",
            path,
            "-H",
            "broker.lan",
            "--mqtt-port",
            "8883",
            "-u",
            "gw",
            "--mqtt-password",
            "pw",
            "-r",
            "home/",
            "-e",
            "state_changed",
            "-e",
            "call_service",
            "--keepalive-secs",
            "0",
        ]);
        let config = GatewayConfig::from_cli(&cli).unwrap();

        assert_eq!(config.hass.url(), "ws://10.0.0.2:9000/api/websocket");
        assert_eq!(
            config.hass.event_types(),
            ["state_changed", "call_service"]
        );
        assert_eq!(config.hass.keepalive_interval(), None);
        assert_eq!(config.root_topic, "home");
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.client_id, "home");
        assert_eq!(
            config.mqtt.credentials,
            Some(("gw".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn wildcard_root_is_rejected() {
        let file = token_file("secret");
        let path = file.path().to_str().unwrap();
        let cli = parse(&["ha", "-f", path, "-r", "home/#"]);
        assert!(matches!(
            GatewayConfig::from_cli(&cli),
            Err(GatewayError::Config { .. })
        ));
    }

    #[test]
    fn token_file_is_required() {
        assert!(Cli::try_parse_from(["ha-mqtt-gateway", "ha"]).is_err());
    }
}
