use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum EventAction {
    ConnectionStatus,
    Join,
    Leave,
    Message,
    Event,
    Other(String),
}

impl EventAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionStatus => "connection_status",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Message => "message",
            Self::Event => "event",
            Self::Other(action) => action,
        }
    }
}

impl From<String> for EventAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "connection_status" => Self::ConnectionStatus,
            "join" => Self::Join,
            "leave" => Self::Leave,
            "message" => Self::Message,
            "event" => Self::Event,
            _ => Self::Other(value),
        }
    }
}

impl From<EventAction> for String {
    fn from(value: EventAction) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealtimeEvent {
    pub action: EventAction,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<u64>,
}

impl RealtimeEvent {
    /// Identity used for duplicate suppression.
    ///
    /// Combines the action with the serialized payload. The send timestamp is
    /// deliberately excluded, so two events that differ only in `sent_at_ms`
    /// collapse into one delivery.
    pub fn fingerprint(&self) -> String {
        let payload = serde_json::to_string(&self.payload).unwrap_or_default();
        format!("{}-{}", self.action.as_str(), payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Ping {
        client_time_ms: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event {
        channel: String,
        action: EventAction,
        payload: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        sent_at_ms: Option<u64>,
    },
    ChannelError {
        channel: String,
        code: String,
        message: String,
    },
    Pong {
        server_time_ms: u64,
    },
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_wire_shape() {
        let msg = ClientMessage::Subscribe {
            channel: "dashboard/42".to_string(),
        };
        assert_eq!(
            msg.to_text().expect("encode"),
            r#"{"type":"subscribe","channel":"dashboard/42"}"#
        );
    }

    #[test]
    fn authenticate_omits_absent_token() {
        let msg = ClientMessage::Authenticate { token: None };
        assert_eq!(msg.to_text().expect("encode"), r#"{"type":"authenticate"}"#);
    }

    #[test]
    fn event_decodes_with_known_action() {
        let text = r#"{"type":"event","channel":"dashboard/42","action":"message","payload":{"id":7},"sent_at_ms":1700000000000}"#;
        let decoded = ServerMessage::from_text(text).expect("decode");
        assert_eq!(
            decoded,
            ServerMessage::Event {
                channel: "dashboard/42".to_string(),
                action: EventAction::Message,
                payload: json!({"id": 7}),
                sent_at_ms: Some(1_700_000_000_000),
            }
        );
    }

    #[test]
    fn unknown_action_is_preserved() {
        let action: EventAction = serde_json::from_str(r#""presence_diff""#).expect("decode");
        assert_eq!(action, EventAction::Other("presence_diff".to_string()));
        assert_eq!(
            serde_json::to_string(&action).expect("encode"),
            r#""presence_diff""#
        );
    }

    #[test]
    fn fingerprint_ignores_send_timestamp() {
        let first = RealtimeEvent {
            action: EventAction::Message,
            payload: json!({"id": 1, "body": "hi"}),
            sent_at_ms: Some(1),
        };
        let second = RealtimeEvent {
            sent_at_ms: Some(2),
            ..first.clone()
        };
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn fingerprint_separates_action_and_payload_changes() {
        let base = RealtimeEvent {
            action: EventAction::Message,
            payload: json!({"id": 1}),
            sent_at_ms: None,
        };
        let other_action = RealtimeEvent {
            action: EventAction::Leave,
            ..base.clone()
        };
        let other_payload = RealtimeEvent {
            payload: json!({"id": 2}),
            ..base.clone()
        };
        assert_ne!(base.fingerprint(), other_action.fingerprint());
        assert_ne!(base.fingerprint(), other_payload.fingerprint());
    }
}
