//! Event emitter: stamps and publishes tool events over a room channel

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::debug;

use switchboard_core::{Command, ToolEvent, ToolEventType, ToolType};

use crate::protocol::RoomEnvelope;
use crate::transport::{Delivery, TransportChannel};

/// An unstamped tool event
#[derive(Debug, Clone)]
pub struct ToolEventDraft {
    pub tool_type: ToolType,
    pub event_type: ToolEventType,
    pub data: Map<String, Value>,
    pub correlation_id: Option<String>,
}

impl ToolEventDraft {
    pub fn new(tool_type: ToolType, event_type: ToolEventType) -> Self {
        Self {
            tool_type,
            event_type,
            data: Map::new(),
            correlation_id: None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Tie this event to the command it acknowledges
    pub fn in_reply_to(mut self, command: &Command) -> Self {
        self.correlation_id = Some(command.correlation_id().to_string());
        self
    }
}

/// Publishes tool events for one room and user
#[derive(Clone)]
pub struct EventEmitter {
    channel: TransportChannel,
    user_id: Option<String>,
}

impl EventEmitter {
    pub fn new(channel: TransportChannel, user_id: Option<String>) -> Self {
        Self { channel, user_id }
    }

    /// Fill in id, timestamp, room and user
    pub fn stamp(&self, draft: ToolEventDraft) -> ToolEvent {
        ToolEvent {
            id: uuid::Uuid::new_v4().to_string(),
            tool_type: draft.tool_type,
            event_type: draft.event_type,
            data: draft.data,
            timestamp: Utc::now(),
            user_id: self.user_id.clone(),
            room_id: Some(self.channel.room_id().to_string()),
            correlation_id: draft.correlation_id,
        }
    }

    /// Stamp and send. Dropped (and logged by the channel) when disconnected.
    pub fn send_tool_event(&self, draft: ToolEventDraft) -> Delivery {
        let event = self.stamp(draft);
        debug!(
            "Emitting {:?} event {} for {}",
            event.event_type, event.id, event.tool_type
        );
        self.channel.send(&RoomEnvelope::ToolEvent(event))
    }
}
