/// Request body of the chat endpoint and extraction of the text sent to the agent.
use serde::Deserialize;
use serde_json::Value;

use crate::errors::ChatError;
use crate::traits::{Role, Visibility};

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Conversation id. Also used as the backend thread id.
    pub id: String,
    pub message: IncomingMessage,
    #[serde(default)]
    pub selected_visibility_type: Visibility,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    pub role: Role,
    /// Ordered content parts. Only `{"type": "text", "text": ...}` parts carry text; the rest are
    /// stored but not sent to the agent.
    pub parts: Vec<Value>,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ChatRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, ChatError> {
        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|e| ChatError::BadRequest(format!("invalid request body: {e}")))?;
        if request.id.trim().is_empty() {
            return Err(ChatError::BadRequest("missing chat id".to_string()));
        }
        if request.message.role != Role::User {
            return Err(ChatError::BadRequest(
                "only user messages can be sent".to_string(),
            ));
        }
        Ok(request)
    }
}

impl IncomingMessage {
    /// Text of every text part, joined by newlines.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Like [`text`](Self::text), but rejects messages without any text.
    pub fn require_text(&self) -> Result<String, ChatError> {
        let text = self.text();
        if text.trim().is_empty() {
            return Err(ChatError::BadRequest(
                "message contains no text".to_string(),
            ));
        }
        Ok(text)
    }
}
