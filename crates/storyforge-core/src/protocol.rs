//! Outbound event protocol.
//!
//! Every event the engine emits is a `{type, content, metadata}` JSON object.
//! A `tool_call` event whose content is `update_scenario` or `create_scenario`
//! tells the caller to apply `metadata.parameters.updated_scenario` (or
//! `.scenario`) to its own copy; the engine never persists scenarios itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::types::ToolAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Chat,
    ToolCall,
    Error,
    Completion,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Status => "status",
            EventType::Chat => "chat",
            EventType::ToolCall => "tool_call",
            EventType::Error => "error",
            EventType::Completion => "completion",
        }
    }
}

/// The wire unit emitted to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub content: String,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl StreamingEvent {
    pub fn new(event_type: EventType, content: impl Into<String>) -> Self {
        Self {
            event_type,
            content: content.into(),
            metadata: empty_object(),
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::new(EventType::Status, content)
    }

    pub fn chat(delta: impl Into<String>) -> Self {
        Self::new(EventType::Chat, delta)
    }

    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        Self::new(EventType::Error, message).with_metadata("kind", json!(kind))
    }

    /// A structured result the caller must apply to its own state.
    pub fn tool_call(action: ToolAction, parameters: Value) -> Self {
        Self {
            event_type: EventType::ToolCall,
            content: action.as_str().to_string(),
            metadata: json!({
                "action": action.as_str(),
                "parameters": parameters,
            }),
        }
    }

    pub fn completion(content: impl Into<String>, metadata: Value) -> Self {
        Self {
            event_type: EventType::Completion,
            content: content.into(),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = empty_object();
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type == EventType::Completion
    }
}
