//! Room channel protocol: JSON envelopes `{type, ...payload}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use switchboard_core::{Command, Error, Result, ToolEvent};

/// A chat line posted in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub sender: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// A room member (human or simulated agent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Everything that travels over a room channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEnvelope {
    ChatMessage(ChatMessage),
    ParticipantAdded(Participant),
    ParticipantRemoved { participant_id: String },
    ToolCommand(Command),
    ToolEvent(ToolEvent),
}

// ── Envelope type names ──

pub mod kinds {
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const PARTICIPANT_ADDED: &str = "participant_added";
    pub const PARTICIPANT_REMOVED: &str = "participant_removed";
    pub const TOOL_COMMAND: &str = "tool_command";
    pub const TOOL_EVENT: &str = "tool_event";
}

impl RoomEnvelope {
    /// The `type` discriminator of this envelope
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEnvelope::ChatMessage(_) => kinds::CHAT_MESSAGE,
            RoomEnvelope::ParticipantAdded(_) => kinds::PARTICIPANT_ADDED,
            RoomEnvelope::ParticipantRemoved { .. } => kinds::PARTICIPANT_REMOVED,
            RoomEnvelope::ToolCommand(_) => kinds::TOOL_COMMAND,
            RoomEnvelope::ToolEvent(_) => kinds::TOOL_EVENT,
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            Error::Parse(format!(
                "invalid room envelope ({}): {}",
                e,
                text.chars().take(100).collect::<String>()
            ))
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tool_command() {
        let json = r#"{"type":"tool_command","action":"create_task","parameters":{"title":"Fix bug"}}"#;
        match RoomEnvelope::decode(json).unwrap() {
            RoomEnvelope::ToolCommand(cmd) => {
                assert_eq!(cmd.action, "create_task");
                assert_eq!(cmd.param_str("title"), Some("Fix bug"));
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }

    #[test]
    fn test_encode_tool_command_is_flat() {
        let env = RoomEnvelope::ToolCommand(Command::new("open_panel").with_param("panel", "metrics"));
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "tool_command");
        assert_eq!(json["action"], "open_panel");
        assert_eq!(json["parameters"]["panel"], "metrics");
    }

    #[test]
    fn test_decode_chat_and_participants() {
        let chat = RoomEnvelope::decode(
            r#"{"type":"chat_message","sender":"cfo-agent","content":"Q3 numbers are in"}"#,
        )
        .unwrap();
        assert_eq!(chat.kind(), kinds::CHAT_MESSAGE);

        let added = RoomEnvelope::decode(
            r#"{"type":"participant_added","participant_id":"p1","display_name":"Ops Bot"}"#,
        )
        .unwrap();
        assert_eq!(added.kind(), kinds::PARTICIPANT_ADDED);

        let removed =
            RoomEnvelope::decode(r#"{"type":"participant_removed","participant_id":"p1"}"#).unwrap();
        assert_eq!(
            removed,
            RoomEnvelope::ParticipantRemoved {
                participant_id: "p1".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = RoomEnvelope::decode(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(RoomEnvelope::decode("not json at all").is_err());
        assert!(RoomEnvelope::decode(r#"{"action":"no type"}"#).is_err());
    }
}
