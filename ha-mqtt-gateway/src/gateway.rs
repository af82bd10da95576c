//! The bridge loop.
//!
//! [`Gateway::run`] is the only place bridge state lives. Home Assistant
//! notifications, MQTT notifications and snapshot results all arrive over
//! channels and are handled one at a time on this task.

use hass_ws_client::{ClientEvent, HassHandle};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::{self, CommandRejection};
use crate::error::{GatewayError, GatewayResult};
use crate::mqtt::{MqttEvent, Publish, OFFLINE, ONLINE};
use crate::topics::Topics;

pub struct Gateway<P> {
    topics: Topics,
    publisher: P,
    hass: HassHandle,
    mqtt_connected: bool,
    hass_authenticated: bool,
    snapshots_tx: mpsc::UnboundedSender<Vec<Value>>,
    snapshots_rx: mpsc::UnboundedReceiver<Vec<Value>>,
}

impl<P: Publish> Gateway<P> {
    pub fn new(topics: Topics, publisher: P, hass: HassHandle) -> Self {
        let (snapshots_tx, snapshots_rx) = mpsc::unbounded_channel();
        Self {
            topics,
            publisher,
            hass,
            mqtt_connected: false,
            hass_authenticated: false,
            snapshots_tx,
            snapshots_rx,
        }
    }

    /// Bridge until `cancel` fires or the broker refuses the connection.
    ///
    /// On the way out the gateway publishes the offline marker and
    /// disconnects from the broker.
    pub async fn run(
        mut self,
        mut hass_events: mpsc::UnboundedReceiver<ClientEvent>,
        mut mqtt_events: mpsc::UnboundedReceiver<MqttEvent>,
        cancel: CancellationToken,
    ) -> GatewayResult<()> {
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                Some(event) = hass_events.recv() => self.on_hass_event(event),

                Some(event) = mqtt_events.recv() => {
                    if let Err(e) = self.on_mqtt_event(event) {
                        break Err(e);
                    }
                }

                Some(states) = self.snapshots_rx.recv() => self.publish_snapshot(states),
            }
        };

        self.shutdown();
        result
    }

    fn on_hass_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Authenticated { .. } => {
                self.hass_authenticated = true;
                self.publish_status();
                self.request_snapshot();
            }
            ClientEvent::Event(event) => {
                if let Some(state) = bridge::event_state(event) {
                    self.publish_state(state);
                }
            }
            ClientEvent::Disconnected => {
                if std::mem::replace(&mut self.hass_authenticated, false) {
                    self.publish_status();
                }
            }
        }
    }

    fn on_mqtt_event(&mut self, event: MqttEvent) -> GatewayResult<()> {
        match event {
            MqttEvent::Connected => {
                self.mqtt_connected = true;
                let filter = self.topics.subscription();
                if let Err(e) = self.publisher.subscribe(&filter) {
                    tracing::warn!("Failed to subscribe to {}: {}", filter, e);
                }
                self.publish_status();
            }
            MqttEvent::Disconnected => {
                tracing::warn!("MQTT disconnected");
                self.mqtt_connected = false;
            }
            MqttEvent::Message { topic, payload } => self.on_command(&topic, &payload),
            MqttEvent::Refused { code } => return Err(GatewayError::MqttRefused { code }),
        }
        Ok(())
    }

    fn on_command(&self, topic: &str, payload: &[u8]) {
        let call = match bridge::service_call(&self.topics, topic, payload) {
            Ok(call) => call,
            Err(CommandRejection::NotCommand) => return,
            Err(e) => {
                tracing::warn!("Dropping command on {}: {}", topic, e);
                return;
            }
        };

        tracing::debug!(
            "Calling {}.{} on {}",
            call.domain,
            call.service,
            call.entity_id
        );

        let hass = self.hass.clone();
        tokio::spawn(async move {
            let name = format!("{}.{}", call.domain, call.service);
            match hass.call_service(call).await {
                Ok(_) => tracing::debug!("{} succeeded", name),
                // The MQTT message is consumed; there is nothing to retry.
                Err(e) if e.is_canceled() => tracing::debug!("{} canceled: {}", name, e),
                Err(e) => tracing::warn!("{} failed: {}", name, e),
            }
        });
    }

    /// Fetch every state in the background; the result comes back through
    /// the snapshot channel.
    fn request_snapshot(&self) {
        let hass = self.hass.clone();
        let snapshots = self.snapshots_tx.clone();
        tokio::spawn(async move {
            match hass.get_states().await {
                Ok(states) => {
                    let _ = snapshots.send(states);
                }
                Err(e) if e.is_canceled() => {}
                Err(e) => tracing::warn!("get_states failed: {}", e),
            }
        });
    }

    fn publish_snapshot(&mut self, states: Vec<Value>) {
        tracing::info!("Publishing {} entity states", states.len());
        for state in states {
            self.publish_state(state);
        }
    }

    fn publish_state(&mut self, state: Value) {
        if !self.mqtt_connected {
            return;
        }
        if let Some(publication) = bridge::state_publication(&self.topics, state) {
            self.send(&publication.topic, publication.payload, publication.retain);
        }
    }

    fn publish_status(&mut self) {
        if !self.mqtt_connected {
            return;
        }
        let status = if self.hass_authenticated { ONLINE } else { OFFLINE };
        let topic = self.topics.connected();
        self.send(&topic, status.into(), true);
    }

    fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        if let Err(e) = self.publisher.publish(topic, payload, retain) {
            tracing::warn!("Failed to publish to {}: {}", topic, e);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("Shutting down gateway");

        let topic = self.topics.connected();
        self.send(&topic, OFFLINE.into(), true);
        if let Err(e) = self.publisher.disconnect() {
            tracing::warn!("MQTT disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hass_ws_client::Event;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Publish {
            topic: String,
            payload: String,
            retain: bool,
        },
        Subscribe(String),
        Disconnect,
    }

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    impl RecordingPublisher {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Publish for RecordingPublisher {
        fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> GatewayResult<()> {
            self.sent.lock().unwrap().push(Sent::Publish {
                topic: topic.to_string(),
                payload: String::from_utf8(payload).unwrap(),
                retain,
            });
            Ok(())
        }

        fn subscribe(&self, filter: &str) -> GatewayResult<()> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Subscribe(filter.to_string()));
            Ok(())
        }

        fn disconnect(&self) -> GatewayResult<()> {
            self.sent.lock().unwrap().push(Sent::Disconnect);
            Ok(())
        }
    }

    fn publish(topic: &str, payload: &str) -> Sent {
        Sent::Publish {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }

    // The client is never run; requests made through the handle fail with
    // `Shutdown`, which the gateway swallows.
    fn fixture() -> (Gateway<RecordingPublisher>, RecordingPublisher, HassHandle) {
        let publisher = RecordingPublisher::default();
        let (_client, handle, _events) =
            hass_ws_client::HassClient::new(hass_ws_client::ClientConfig::new("ws://x", "t"));
        let gateway = Gateway::new(Topics::new("gw"), publisher.clone(), handle.clone());
        (gateway, publisher, handle)
    }

    fn state_changed(entity_id: &str, new_state: Value) -> ClientEvent {
        ClientEvent::Event(Event {
            event_type: "state_changed".into(),
            data: json!({"entity_id": entity_id, "new_state": new_state}),
            origin: None,
            time_fired: None,
        })
    }

    #[tokio::test]
    async fn mqtt_connect_subscribes_and_reports_offline_until_authenticated() {
        let (mut gateway, publisher, _handle) = fixture();

        gateway.on_mqtt_event(MqttEvent::Connected).unwrap();
        assert_eq!(
            publisher.take(),
            vec![Sent::Subscribe("gw/#".into()), publish("gw/connected", "0")]
        );
    }

    #[tokio::test]
    async fn authentication_toggles_connected_marker() {
        let (mut gateway, publisher, _handle) = fixture();
        gateway.on_mqtt_event(MqttEvent::Connected).unwrap();
        publisher.take();

        gateway.on_hass_event(ClientEvent::Authenticated { ha_version: None });
        assert_eq!(publisher.take(), vec![publish("gw/connected", "1")]);

        gateway.on_hass_event(ClientEvent::Disconnected);
        assert_eq!(publisher.take(), vec![publish("gw/connected", "0")]);

        // A second disconnect (e.g. a failed attempt) does not repeat it.
        gateway.on_hass_event(ClientEvent::Disconnected);
        assert!(publisher.take().is_empty());
    }

    #[tokio::test]
    async fn state_changed_event_publishes_once_retained() {
        let (mut gateway, publisher, _handle) = fixture();
        gateway.on_mqtt_event(MqttEvent::Connected).unwrap();
        publisher.take();

        gateway.on_hass_event(state_changed(
            "light.kitchen",
            json!({
                "entity_id": "light.kitchen",
                "state": "on",
                "attributes": {"brightness": 255},
                "context": {"id": "abc"}
            }),
        ));

        assert_eq!(
            publisher.take(),
            vec![publish("gw/light.kitchen/state", r#"{"state":"on"}"#)]
        );
    }

    #[tokio::test]
    async fn nothing_is_published_while_mqtt_is_down() {
        let (mut gateway, publisher, _handle) = fixture();

        gateway.on_hass_event(state_changed(
            "light.kitchen",
            json!({"entity_id": "light.kitchen", "state": "on"}),
        ));
        gateway.publish_snapshot(vec![json!({"entity_id": "sun.sun", "state": "above_horizon"})]);
        assert!(publisher.take().is_empty());
    }

    #[tokio::test]
    async fn snapshot_publishes_every_state() {
        let (mut gateway, publisher, _handle) = fixture();
        gateway.on_mqtt_event(MqttEvent::Connected).unwrap();
        publisher.take();

        gateway.publish_snapshot(vec![
            json!({"entity_id": "sun.sun", "state": "above_horizon"}),
            json!({"entity_id": "light.kitchen", "state": "off"}),
            json!({"state": "orphan"}),
        ]);

        assert_eq!(
            publisher.take(),
            vec![
                publish("gw/sun.sun/state", r#"{"state":"above_horizon"}"#),
                publish("gw/light.kitchen/state", r#"{"state":"off"}"#),
            ]
        );
    }

    #[tokio::test]
    async fn refused_connection_is_fatal() {
        let (mut gateway, _publisher, _handle) = fixture();
        let err = gateway
            .on_mqtt_event(MqttEvent::Refused {
                code: "BadUserNamePassword".into(),
            })
            .unwrap_err();
        assert!(matches!(err, GatewayError::MqttRefused { .. }));
    }

    #[tokio::test]
    async fn run_publishes_offline_and_disconnects_on_cancel() {
        let (gateway, publisher, _handle) = fixture();
        let (_hass_tx, hass_rx) = mpsc::unbounded_channel();
        let (mqtt_tx, mqtt_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        mqtt_tx.send(MqttEvent::Connected).unwrap();
        let task = tokio::spawn(gateway.run(hass_rx, mqtt_rx, cancel.clone()));
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            publisher.take(),
            vec![
                Sent::Subscribe("gw/#".into()),
                publish("gw/connected", "0"),
                publish("gw/connected", "0"),
                Sent::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn non_command_topics_are_ignored() {
        let (mut gateway, publisher, _handle) = fixture();
        gateway.on_mqtt_event(MqttEvent::Connected).unwrap();
        publisher.take();

        gateway
            .on_mqtt_event(MqttEvent::Message {
                topic: "gw/light.kitchen/state".into(),
                payload: br#"{"state":"on"}"#.to_vec(),
            })
            .unwrap();
        gateway
            .on_mqtt_event(MqttEvent::Message {
                topic: "gw/light.kitchen/light.turn_on".into(),
                payload: b"not json".to_vec(),
            })
            .unwrap();

        assert!(publisher.take().is_empty());
    }
}
