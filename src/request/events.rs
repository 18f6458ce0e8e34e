use crate::tools::{ToolInput, ToolOutcome};
use serde::{Deserialize, Serialize};

/// Variant payload of one execution event. The set is closed so every
/// consumer handles every event type; replaying a request's events in
/// sequence order reconstructs the exact client-visible transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        tool_input: ToolInput,
        preview: String,
    },
    ToolResult {
        #[serde(default)]
        tool_call_id: Option<String>,
        tool_name: String,
        outcome: ToolOutcome,
    },
    TextChunk {
        text: String,
    },
    ContextReady {
        document_count: usize,
        assembled_chars: usize,
        token_count: usize,
    },
    Completion {
        message_id: String,
        total_tokens: i64,
        execution_time_ms: i64,
    },
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::TextChunk { .. } => "text_chunk",
            EventPayload::ContextReady { .. } => "context_ready",
            EventPayload::Completion { .. } => "completion",
            EventPayload::Error { .. } => "error",
        }
    }

    /// Completion and error events close the request's transcript.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::Completion { .. } | EventPayload::Error { .. }
        )
    }
}

/// Immutable, append-only record; totally ordered per request by
/// `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub request_id: String,
    pub sequence: i64,
    pub payload: EventPayload,
    pub created_at: i64,
}

/// The streamed text a client saw, reconstructed from the log.
pub fn transcript_text(events: &[ExecutionEvent]) -> String {
    let mut out = String::new();
    for event in events {
        if let EventPayload::TextChunk { text } = &event.payload {
            out.push_str(text);
        }
    }
    out
}
