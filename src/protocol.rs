//! Wire types on both sides of the relay
//!
//! [`UpstreamEvent`] is what the agent backend sends; the shape of each JSON payload decides the
//! variant. [`NormalizedEvent`] is the UI message stream protocol spoken to the chat widget.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::sse::{DONE_SENTINEL, SseFrame};

/// Value of the response header that tells the client which stream decoder to use.
pub const UI_MESSAGE_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const UI_MESSAGE_STREAM_VERSION: &str = "v1";

/// Node labels whose content is the model talking to the user.
const MODEL_NODES: &[&str] = &["agent", "model"];

/// One backend frame, interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// An incremental update from one step of the agent graph.
    ContentUpdate { node: String, content: String },
    Heartbeat,
    ErrorEvent { message: String },
    /// The whole reply so far. Needs diffing against what was already sent.
    RawDelta { text: String },
    StreamEnd,
}

impl UpstreamEvent {
    pub fn from_frame(frame: SseFrame) -> Option<Self> {
        match frame {
            SseFrame::Done => Some(UpstreamEvent::StreamEnd),
            SseFrame::Payload(value) => Self::from_payload(&value),
        }
    }

    /// Classify a JSON payload. Returns `None` for shapes we don't recognise.
    pub fn from_payload(value: &Value) -> Option<Self> {
        let Some(object) = value.as_object() else {
            debug!(payload = %value, "Ignoring non-object backend payload");
            return None;
        };

        if object.get("type").and_then(Value::as_str) == Some("ping") {
            return Some(UpstreamEvent::Heartbeat);
        }

        if let Some(error) = object.get("error").filter(|error| is_reported_error(error)) {
            return Some(UpstreamEvent::ErrorEvent {
                message: error_message(error),
            });
        }

        if let Some(node) = object.get("node").and_then(Value::as_str) {
            let content = object.get("content").map(text_of).unwrap_or_default();
            return Some(UpstreamEvent::ContentUpdate {
                node: node.to_string(),
                content,
            });
        }

        if let Some(messages) = object
            .get("agent")
            .and_then(|agent| agent.get("messages"))
            .and_then(Value::as_array)
        {
            let text = messages
                .iter()
                .rev()
                .filter(|message| is_assistant_message(message))
                .map(|message| message.get("content").map(text_of).unwrap_or_default())
                .find(|text| !text.is_empty())
                .unwrap_or_default();
            return Some(UpstreamEvent::RawDelta { text });
        }

        if let Some(output) = object.get("output") {
            return Some(UpstreamEvent::RawDelta {
                text: text_of(output),
            });
        }

        debug!(payload = %value, "Ignoring backend payload of unknown shape");
        None
    }

    /// Whether this frame comes from the model step rather than e.g. a tool.
    pub fn is_model_node(node: &str) -> bool {
        MODEL_NODES.contains(&node)
    }
}

/// Text carried by a content value: a plain string, or the text blocks of a content array.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(text) => Some(text.as_str()),
                Value::Object(_) if block.get("type").and_then(Value::as_str) == Some("text") => {
                    block.get("text").and_then(Value::as_str)
                }
                _ => None,
            })
            .collect(),
        _ => String::new(),
    }
}

/// Backends may send `"error": null` (or an empty value) on every frame.
fn is_reported_error(error: &Value) -> bool {
    match error {
        Value::Null | Value::Bool(false) => false,
        Value::String(message) => !message.trim().is_empty(),
        _ => true,
    }
}

/// Only the model's own messages carry reply text; user and tool messages never do.
fn is_assistant_message(message: &Value) -> bool {
    ["role", "type"].iter().any(|key| {
        matches!(
            message.get(*key).and_then(Value::as_str),
            Some("assistant" | "ai")
        )
    })
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatData {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// An event of the UI message stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NormalizedEvent {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
    },
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
    #[serde(rename = "data-heartbeat")]
    Heartbeat { data: HeartbeatData },
    /// Written as the bare `[DONE]` sentinel, never as JSON.
    #[serde(skip_serializing)]
    Done,
}

impl NormalizedEvent {
    pub fn heartbeat_now() -> Self {
        NormalizedEvent::Heartbeat {
            data: HeartbeatData {
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        }
    }

    /// Format as an SSE frame.
    pub fn to_sse(&self) -> String {
        let payload = match self {
            NormalizedEvent::Done => DONE_SENTINEL.to_string(),
            event => serde_json::to_string(event).unwrap_or_default(),
        };
        format!("data: {payload}\n\n")
    }
}
