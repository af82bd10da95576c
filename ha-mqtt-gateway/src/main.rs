//! ha-mqtt-gateway - bridge Home Assistant and an MQTT broker

use std::time::Duration;

use clap::Parser;
use ha_mqtt_gateway::{mqtt, Cli, Gateway, GatewayConfig, GatewayResult, Topics};
use hass_ws_client::HassClient;
use tokio_util::sync::CancellationToken;

/// How long to let the MQTT task flush the offline marker on shutdown.
const MQTT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ha_mqtt_gateway=debug,hass_ws_client=debug"
    } else {
        "ha_mqtt_gateway=info,hass_ws_client=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> GatewayResult<()> {
    let config = GatewayConfig::from_cli(&cli)?;
    let topics = Topics::new(config.root_topic.clone());

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    tracing::info!("Starting gateway for {}", config.hass.url());

    let (client, handle, hass_events) = HassClient::new(config.hass.clone());
    let client_task = tokio::spawn(client.run(cancel.clone()));

    let (link, mqtt_events, mut mqtt_task) = mqtt::connect(&config.mqtt, &topics);

    let result = Gateway::new(topics, link, handle)
        .run(hass_events, mqtt_events, cancel.clone())
        .await;

    // A fatal gateway error stops everything else too.
    cancel.cancel();

    if let Err(e) = client_task.await {
        tracing::warn!("Home Assistant client task failed: {}", e);
    }
    if tokio::time::timeout(MQTT_DRAIN_TIMEOUT, &mut mqtt_task)
        .await
        .is_err()
    {
        tracing::warn!("MQTT did not shut down in time");
        mqtt_task.abort();
    }

    result
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) -> GatewayResult<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM, shutting down"),
        }

        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
        }

        cancel.cancel();
    });

    Ok(())
}
