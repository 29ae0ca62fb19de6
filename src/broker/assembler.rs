//! Reassembles ordered chunk sequences into complete message content.
//!
//! One buffer per conversation, owned exclusively by the assembler and
//! released as soon as a terminal chunk is processed. The assembler never
//! retries; the calling collaborator decides that, informed by whether the
//! terminating error was retryable.

use std::collections::HashMap;

use crate::api::StreamingMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerEvent {
    /// Chunk accepted and appended to the in-progress buffer.
    Appended(String),
    /// Terminal completion; carries the full assembled text.
    Completed(String),
    /// Terminal error; no chunk content is appended for error chunks.
    Errored(String),
}

#[derive(Debug, Default)]
struct ConversationBuffer {
    stream_id: String,
    buffer: String,
    last_sequence: Option<u64>,
    terminal: bool,
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    conversations: HashMap<String, ConversationBuffer>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one wire chunk. Returns `None` when the chunk is ignored:
    /// duplicate or stale sequence, or any chunk after the stream went
    /// terminal. Sequence numbers are monotone per conversation, so
    /// `last_sequence` keeps advancing across exchanges; a new stream id
    /// reopens a conversation whose previous stream ended.
    pub fn ingest(&mut self, message: &StreamingMessage) -> Option<AssemblerEvent> {
        let entry = self
            .conversations
            .entry(message.conversation_id.clone())
            .or_default();

        if entry.stream_id != message.id {
            if entry.terminal || entry.stream_id.is_empty() {
                entry.stream_id = message.id.clone();
                entry.buffer.clear();
                entry.terminal = false;
            } else if !entry.buffer.is_empty() || entry.last_sequence.is_some() {
                // A different stream id while one is still open: keep the
                // open stream, treat the stray chunk by sequence rules below.
                entry.stream_id = message.id.clone();
            }
        }

        if entry.terminal {
            return None;
        }

        if let Some(last) = entry.last_sequence {
            if message.sequence <= last {
                return None;
            }
        }
        entry.last_sequence = Some(message.sequence);

        if let Some(error) = &message.error {
            entry.terminal = true;
            entry.buffer = String::new();
            return Some(AssemblerEvent::Errored(error.clone()));
        }

        entry.buffer.push_str(&message.chunk);

        if message.is_complete {
            entry.terminal = true;
            let full = std::mem::take(&mut entry.buffer);
            return Some(AssemblerEvent::Completed(full));
        }

        Some(AssemblerEvent::Appended(message.chunk.clone()))
    }

    /// Whether a stream is currently mid-assembly for this conversation.
    pub fn is_open(&self, conversation_id: &str) -> bool {
        self.conversations
            .get(conversation_id)
            .map(|entry| !entry.terminal && entry.last_sequence.is_some())
            .unwrap_or(false)
    }
}
