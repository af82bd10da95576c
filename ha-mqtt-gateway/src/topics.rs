//! MQTT topic layout.
//!
//! ```text
//! <root>/connected                     "1" / "0", retained
//! <root>/<entity_id>/state             JSON state, retained
//! <root>/<entity_id>/<domain>.<service>   inbound service call
//! ```

/// A parsed inbound command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTopic<'a> {
    pub entity_id: &'a str,
    pub domain: &'a str,
    pub service: &'a str,
}

/// Topic builder/parser rooted at one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Connectivity status topic.
    pub fn connected(&self) -> String {
        format!("{}/connected", self.root)
    }

    /// Last-known state topic for an entity.
    pub fn state(&self, entity_id: &str) -> String {
        format!("{}/{}/state", self.root, entity_id)
    }

    /// Filter covering every topic under the root.
    pub fn subscription(&self) -> String {
        format!("{}/#", self.root)
    }

    /// Parse `<root>/<entity_id>/<domain>.<service>`.
    ///
    /// Anything else under the root (including the gateway's own `state`
    /// and `connected` topics) yields `None`.
    pub fn parse_command<'a>(&self, topic: &'a str) -> Option<CommandTopic<'a>> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let (entity_id, action) = rest.split_once('/')?;
        if entity_id.is_empty() || action.contains('/') {
            return None;
        }

        let (domain, service) = action.split_once('.')?;
        if domain.is_empty() || service.is_empty() {
            return None;
        }

        Some(CommandTopic {
            entity_id,
            domain,
            service,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("ha-mqtt-gateway")
    }

    #[test]
    fn builds_outbound_topics() {
        let t = topics();
        assert_eq!(t.connected(), "ha-mqtt-gateway/connected");
        assert_eq!(t.state("light.kitchen"), "ha-mqtt-gateway/light.kitchen/state");
        assert_eq!(t.subscription(), "ha-mqtt-gateway/#");
    }

    #[test]
    fn parses_command_topic() {
        assert_eq!(
            topics().parse_command("ha-mqtt-gateway/light.kitchen/light.turn_on"),
            Some(CommandTopic {
                entity_id: "light.kitchen",
                domain: "light",
                service: "turn_on",
            })
        );
    }

    #[test]
    fn service_keeps_further_dots() {
        let cmd = topics()
            .parse_command("ha-mqtt-gateway/script.x/script.run.now")
            .unwrap();
        assert_eq!(cmd.domain, "script");
        assert_eq!(cmd.service, "run.now");
    }

    #[test]
    fn ignores_non_command_topics() {
        let t = topics();
        for topic in [
            "ha-mqtt-gateway/connected",
            "ha-mqtt-gateway/light.kitchen/state",
            "ha-mqtt-gateway/light.kitchen",
            "ha-mqtt-gateway/a/b/light.turn_on",
            "ha-mqtt-gateway//light.turn_on",
            "ha-mqtt-gateway/light.kitchen/.turn_on",
            "ha-mqtt-gateway/light.kitchen/light.",
            "ha-mqtt-gatewayX/light.kitchen/light.turn_on",
            "other/light.kitchen/light.turn_on",
        ] {
            assert_eq!(t.parse_command(topic), None, "{topic}");
        }
    }
}
