//! Translation between Home Assistant payloads and MQTT messages.
//!
//! Pure functions only; the [`Gateway`](crate::Gateway) decides when to
//! call them and where the results go.

use hass_ws_protocol::{Event, ServiceCall};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::topics::Topics;

/// State fields that never leave the gateway.
const STRIPPED_FIELDS: [&str; 3] = ["attributes", "context", "entity_id"];

/// An outbound MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Why an inbound MQTT message did not become a service call.
#[derive(Debug, Error)]
pub enum CommandRejection {
    /// Topic is not `<root>/<entity>/<domain>.<service>`.
    #[error("not a command topic")]
    NotCommand,

    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is JSON but not an object")]
    NotObject,
}

/// Build the retained state publication for one entity state record.
///
/// Returns `None` for anything without a string `entity_id`.
pub fn state_publication(topics: &Topics, state: Value) -> Option<Publication> {
    let Value::Object(mut state) = state else {
        return None;
    };
    let entity_id = match state.get("entity_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        _ => return None,
    };

    for field in STRIPPED_FIELDS {
        state.remove(field);
    }

    let payload = serde_json::to_vec(&state).ok()?;
    Some(Publication {
        topic: topics.state(&entity_id),
        payload,
        retain: true,
    })
}

/// The new state carried by a `state_changed` event, if any.
///
/// Removal events carry `new_state: null` and yield `None`.
pub fn event_state(event: Event) -> Option<Value> {
    let Value::Object(mut data) = event.data else {
        return None;
    };
    data.remove("new_state").filter(Value::is_object)
}

/// Turn an inbound MQTT message into a service call.
pub fn service_call(
    topics: &Topics,
    topic: &str,
    payload: &[u8],
) -> Result<ServiceCall, CommandRejection> {
    let command = topics
        .parse_command(topic)
        .ok_or(CommandRejection::NotCommand)?;

    let text = std::str::from_utf8(payload).map_err(|_| CommandRejection::NotUtf8)?;
    let text = text.trim();

    let data = if text.is_empty() {
        Map::new()
    } else {
        match serde_json::from_str(text)? {
            Value::Object(data) => data,
            _ => return Err(CommandRejection::NotObject),
        }
    };

    Ok(ServiceCall::new(command.domain, command.service, command.entity_id).with_data(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn topics() -> Topics {
        Topics::new("gw")
    }

    #[test]
    fn publication_strips_bulky_fields() {
        let state = json!({
            "entity_id": "light.kitchen",
            "state": "on",
            "attributes": {"brightness": 255},
            "context": {"id": "01H"},
            "last_changed": "2024-01-01T00:00:00+00:00"
        });

        let publication = state_publication(&topics(), state).unwrap();
        assert_eq!(publication.topic, "gw/light.kitchen/state");
        assert!(publication.retain);

        let payload: Value = serde_json::from_slice(&publication.payload).unwrap();
        assert_eq!(
            payload,
            json!({"state": "on", "last_changed": "2024-01-01T00:00:00+00:00"})
        );
    }

    #[test]
    fn publication_needs_entity_id() {
        assert!(state_publication(&topics(), json!({"state": "on"})).is_none());
        assert!(state_publication(&topics(), json!({"entity_id": 3})).is_none());
        assert!(state_publication(&topics(), json!(null)).is_none());
    }

    #[test]
    fn event_state_extracts_new_state() {
        let event = Event {
            event_type: "state_changed".into(),
            data: json!({"entity_id": "light.kitchen", "new_state": {"state": "on"}}),
            origin: None,
            time_fired: None,
        };
        assert_eq!(event_state(event), Some(json!({"state": "on"})));

        let removed = Event {
            event_type: "state_changed".into(),
            data: json!({"entity_id": "light.kitchen", "new_state": null}),
            origin: None,
            time_fired: None,
        };
        assert_eq!(event_state(removed), None);
    }

    #[test]
    fn command_with_payload() {
        let call = service_call(&topics(), "gw/light.kitchen/light.turn_on", br#"{"brightness": 80}"#)
            .unwrap();
        assert_eq!(call.domain, "light");
        assert_eq!(call.service, "turn_on");
        assert_eq!(call.entity_id, "light.kitchen");
        assert_eq!(Value::Object(call.data), json!({"brightness": 80}));
    }

    #[test]
    fn blank_payload_means_no_data() {
        for payload in [&b""[..], &b"   \n"[..]] {
            let call = service_call(&topics(), "gw/switch.fan/switch.toggle", payload).unwrap();
            assert!(call.data.is_empty());
        }
    }

    #[test]
    fn rejects_bad_payloads() {
        let topic = "gw/light.kitchen/light.turn_on";
        assert!(matches!(
            service_call(&topics(), topic, b"not json"),
            Err(CommandRejection::InvalidJson(_))
        ));
        assert!(matches!(
            service_call(&topics(), topic, b"[1, 2]"),
            Err(CommandRejection::NotObject)
        ));
        assert!(matches!(
            service_call(&topics(), topic, &[0xff, 0xfe]),
            Err(CommandRejection::NotUtf8)
        ));
        assert!(matches!(
            service_call(&topics(), "gw/light.kitchen/state", b"{}"),
            Err(CommandRejection::NotCommand)
        ));
    }
}
