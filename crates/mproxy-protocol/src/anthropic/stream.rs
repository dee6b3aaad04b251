use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::chat::MessagesUsage;

/// Anthropic messages stream events. Unknown event kinds are preserved as raw
/// JSON so passthrough never drops data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Known(KnownStreamEvent),
    Unknown(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownStreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: Value,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: MessagesUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: Value,
    },
}

impl KnownStreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            KnownStreamEvent::MessageStart { .. } => "message_start",
            KnownStreamEvent::ContentBlockStart { .. } => "content_block_start",
            KnownStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            KnownStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            KnownStreamEvent::MessageDelta { .. } => "message_delta",
            KnownStreamEvent::MessageStop => "message_stop",
            KnownStreamEvent::Ping => "ping",
            KnownStreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessageStart {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: MessagesUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}
