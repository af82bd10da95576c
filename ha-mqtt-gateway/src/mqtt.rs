//! MQTT link.
//!
//! rumqttc needs its event loop polled continuously. That happens in a
//! dedicated task which only forwards notifications as [`MqttEvent`]s; it
//! never touches gateway state.
//!
//! Outbound requests go through [`MqttLink`] onto an unbounded queue. A
//! second task drains that queue in order and awaits each request on the
//! rumqttc client, so a slow broker applies backpressure to the drain task
//! instead of dropping publishes or blocking the gateway loop.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::topics::Topics;

/// Marker published on `<root>/connected` while the bridge is up.
pub const ONLINE: &str = "1";
/// Marker published on `<root>/connected` otherwise, and the last will.
pub const OFFLINE: &str = "0";

/// Pause between reconnect attempts after an event loop error.
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Capacity of rumqttc's request queue.
const REQUEST_CAPACITY: usize = 64;

/// Outbound side of the MQTT connection.
pub trait Publish {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> GatewayResult<()>;
    fn subscribe(&self, filter: &str) -> GatewayResult<()>;
    fn disconnect(&self) -> GatewayResult<()>;
}

/// Notifications from the MQTT event loop task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    /// Broker accepted the connection (also after every reconnect).
    Connected,
    /// Connection lost; rumqttc keeps retrying.
    Disconnected,
    /// Inbound publish on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Broker refused the connection. The event loop has stopped.
    Refused { code: String },
}

/// A request waiting for the drain task.
#[derive(Debug)]
enum Outbound {
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Subscribe(String),
    Disconnect,
}

/// [`Publish`] implementation over a rumqttc client.
///
/// Requests are queued without bound and sent in the order they were
/// made. They fail only once the MQTT task has stopped.
#[derive(Clone)]
pub struct MqttLink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl MqttLink {
    fn enqueue(&self, request: Outbound) -> GatewayResult<()> {
        self.outbound
            .send(request)
            .map_err(|_| GatewayError::MqttStopped)
    }
}

impl Publish for MqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> GatewayResult<()> {
        self.enqueue(Outbound::Publish {
            topic: topic.to_string(),
            payload,
            retain,
        })
    }

    fn subscribe(&self, filter: &str) -> GatewayResult<()> {
        self.enqueue(Outbound::Subscribe(filter.to_string()))
    }

    fn disconnect(&self) -> GatewayResult<()> {
        self.enqueue(Outbound::Disconnect)
    }
}

/// Build the rumqttc options, including the offline last will.
pub fn options(config: &MqttConfig, topics: &Topics) -> MqttOptions {
    let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_last_will(LastWill::new(
        topics.connected(),
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    if let Some((username, password)) = &config.credentials {
        options.set_credentials(username, password);
    }

    options
}

/// Create the client and spawn the MQTT task.
///
/// The returned handle finishes once the event loop has stopped and every
/// queued request has been handed to it (or can no longer be).
pub fn connect(
    config: &MqttConfig,
    topics: &Topics,
) -> (MqttLink, mpsc::UnboundedReceiver<MqttEvent>, JoinHandle<()>) {
    let (client, event_loop) = AsyncClient::new(options(config, topics), REQUEST_CAPACITY);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let broker = format!("{}:{}", config.host, config.port);
    tracing::info!("Connecting to MQTT broker {}", broker);

    let task = tokio::spawn(async move {
        tokio::join!(
            run_event_loop(event_loop, events_tx, broker),
            drain_outbound(client, outbound_rx),
        );
    });

    (
        MqttLink {
            outbound: outbound_tx,
        },
        events_rx,
        task,
    )
}

/// Hand queued requests to rumqttc one at a time, waiting for room in its
/// request queue. Stops after a disconnect, once every [`MqttLink`] is
/// gone, or when the event loop has stopped.
async fn drain_outbound(client: AsyncClient, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(request) = outbound.recv().await {
        let result = match request {
            Outbound::Publish {
                topic,
                payload,
                retain,
            } => {
                client
                    .publish(topic, QoS::AtLeastOnce, retain, payload)
                    .await
            }
            Outbound::Subscribe(filter) => client.subscribe(filter, QoS::AtLeastOnce).await,
            Outbound::Disconnect => {
                if let Err(e) = client.disconnect().await {
                    tracing::debug!("MQTT disconnect not sent: {}", e);
                }
                break;
            }
        };

        if let Err(e) = result {
            tracing::warn!("MQTT event loop is gone, dropping queued requests: {}", e);
            break;
        }
    }
}

/// Poll the event loop until the gateway disconnects, the broker refuses
/// us, or the gateway stops listening.
async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::UnboundedSender<MqttEvent>,
    broker: String,
) {
    let mut connected = false;

    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                tracing::info!("MQTT connected to {}", broker);
                Some(MqttEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(MqttEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT disconnect sent to {}", broker);
                break;
            }
            Ok(_) => None,
            Err(ConnectionError::ConnectionRefused(code)) => {
                let _ = events.send(MqttEvent::Refused {
                    code: format!("{code:?}"),
                });
                break;
            }
            Err(e) => {
                tracing::error!("MQTT event loop error for {}: {}", broker, e);

                let was_connected = std::mem::replace(&mut connected, false);
                if was_connected && events.send(MqttEvent::Disconnected).is_err() {
                    break;
                }

                // Wait before reconnecting
                tokio::time::sleep(RETRY_DELAY).await;
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                break;
            }
        }
    }

    tracing::debug!("MQTT event loop for {} stopped", broker);
}
