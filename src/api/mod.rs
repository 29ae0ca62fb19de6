use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }
}

/// One fragment of a streamed response, as it appears on the wire.
///
/// Field names are camelCase on the wire and must round-trip exactly;
/// `model` and `error` are omitted entirely when absent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingMessage {
    pub id: String,
    pub conversation_id: String,
    pub chunk: String,
    pub is_complete: bool,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamingMessage {
    /// A terminal chunk ends its stream, either by completion or by error.
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.error.is_some()
    }

    /// Synthesizes a terminal error chunk for a stream the transport lost.
    pub fn terminal_error(conversation_id: &str, id: &str, sequence: u64, error: String) -> Self {
        Self {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            chunk: String::new(),
            is_complete: false,
            sequence,
            timestamp: Utc::now(),
            model: None,
            error: Some(error),
        }
    }
}
