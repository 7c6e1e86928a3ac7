//! Inbound message routing.
//!
//! Cloud-to-device messages arrive on `.../m/d/{device_id}/{anything}/r`.
//! Everything else is logged and ignored. Command messages are dispatched
//! on `(appId, messageType)`:
//!
//! | appId  | messageType | Action |
//! |--------|-------------|--------|
//! | MODEM  | CMD         | answer from the modem table |
//! | CONFIG | any         | merge into the shadow config |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use trackersim_core::message::SIMULATED_IMSI;
use trackersim_core::{AppId, Envelope, MessageType, ShadowConfigStore, ShadowUpdate};

use crate::connection::Publisher;

/// Reply for any modem command outside the table.
pub const AT_ERROR: &str = "ERROR";

pub const FIRMWARE_VERSION: &str = "mfw_nrf91x1_2.0.2";
pub const HARDWARE_VERSION: &str = "nRF9151 LACA AAA (simulator)";

/// Receives messages from the transport.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_message(&self, topic: &str, payload: &[u8]);
}

/// Whether `topic` is a command topic addressed to `device_id`.
pub fn is_command_topic(topic: &str, device_id: &str) -> bool {
    topic.ends_with("/r") && topic.contains(&format!("/m/d/{}/", device_id))
}

/// Static answers to modem queries.
#[derive(Debug, Clone)]
pub struct ModemCommands {
    responses: HashMap<&'static str, String>,
}

impl ModemCommands {
    pub fn new(device_id: &str) -> Self {
        let responses = HashMap::from([
            ("AT+CGMR", FIRMWARE_VERSION.to_string()),
            ("AT+CGSN", device_id.to_string()),
            ("AT%HWVERSION", HARDWARE_VERSION.to_string()),
            ("AT+CIMI", SIMULATED_IMSI.to_string()),
        ]);
        Self { responses }
    }

    /// Look a command up; unknown commands yield [`AT_ERROR`].
    pub fn respond(&self, command: &str) -> &str {
        self.responses
            .get(command.trim())
            .map(String::as_str)
            .unwrap_or(AT_ERROR)
    }
}

/// What the router did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Payload was not JSON or not an envelope
    Malformed,
    /// Topic is not this device's command channel
    IgnoredTopic,
    ModemReply {
        command: String,
        response: String,
        delivered: bool,
    },
    ConfigUpdate(ShadowUpdate),
    /// Command channel message with an id we do not act on
    Unhandled { app_id: AppId },
}

/// Classifies and dispatches cloud-to-device messages.
pub struct MessageRouter {
    device_id: String,
    modem: ModemCommands,
    shadow: Arc<ShadowConfigStore>,
    publisher: Arc<dyn Publisher>,
}

impl MessageRouter {
    pub fn new(
        device_id: impl Into<String>,
        shadow: Arc<ShadowConfigStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            modem: ModemCommands::new(&device_id),
            device_id,
            shadow,
            publisher,
        }
    }

    pub async fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                let preview = String::from_utf8_lossy(&payload[..payload.len().min(100)]);
                warn!(
                    topic = %topic,
                    error = %e,
                    payload = %preview,
                    "Discarding non-JSON message"
                );
                return RouteOutcome::Malformed;
            }
        };

        if !is_command_topic(topic, &self.device_id) {
            info!(topic = %topic, "Message on non-command topic");
            debug!(payload = %value, "Ignored message payload");
            return RouteOutcome::IgnoredTopic;
        }

        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Discarding command without a valid envelope");
                return RouteOutcome::Malformed;
            }
        };

        info!(
            app_id = %envelope.app_id,
            message_type = ?envelope.message_type,
            "Received command message"
        );

        match (&envelope.app_id, &envelope.message_type) {
            (AppId::Modem, Some(MessageType::Cmd)) => self.handle_modem(&envelope.data).await,
            (AppId::Config, _) => self.handle_config(&envelope.data),
            (app_id, _) => {
                debug!(app_id = %app_id, "No handler for message");
                RouteOutcome::Unhandled {
                    app_id: app_id.clone(),
                }
            }
        }
    }

    async fn handle_modem(&self, data: &Value) -> RouteOutcome {
        let command = data.as_str().unwrap_or_default().to_string();
        let response = self.modem.respond(&command).to_string();
        let delivered = self
            .publisher
            .publish(&Envelope::modem_response(&response))
            .await;
        info!(command = %command, response = %response, delivered, "Answered modem command");
        RouteOutcome::ModemReply {
            command,
            response,
            delivered,
        }
    }

    fn handle_config(&self, data: &Value) -> RouteOutcome {
        match data.as_object() {
            Some(fields) => RouteOutcome::ConfigUpdate(self.shadow.apply_update(fields)),
            None => {
                warn!(data = %data, "CONFIG data is not an object");
                RouteOutcome::ConfigUpdate(ShadowUpdate {
                    applied: Vec::new(),
                    config: self.shadow.snapshot(),
                })
            }
        }
    }
}

#[async_trait]
impl InboundHandler for MessageRouter {
    async fn on_message(&self, topic: &str, payload: &[u8]) {
        self.route(topic, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_topic_classification() {
        let topic = "prod/t1/m/d/device123/x/r";
        assert!(is_command_topic(topic, "device123"));
        assert!(!is_command_topic(topic, "device456"));
        assert!(!is_command_topic("prod/t1/m/d/device123/d2c", "device123"));
        // the id must be a whole segment
        assert!(!is_command_topic("prod/t1/m/d/device1234/x/r", "device123"));
    }

    #[test]
    fn test_modem_table() {
        let modem = ModemCommands::new("dev-9");
        assert_eq!(modem.respond("AT+CGMR"), FIRMWARE_VERSION);
        assert_eq!(modem.respond(" AT+CGSN \n"), "dev-9");
        assert_eq!(modem.respond("AT%HWVERSION"), HARDWARE_VERSION);
        assert_eq!(modem.respond("AT+CIMI"), SIMULATED_IMSI);
        assert_eq!(modem.respond("AT+CFUN=0"), AT_ERROR);
        assert_eq!(modem.respond(""), AT_ERROR);
    }
}
