use crate::tools::ToolOutcome;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("fatal model failure: {0}")]
    Fatal(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }
}

/// One block of packed context material handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBlock {
    pub label: String,
    pub content: String,
}

/// Everything the model needs to run one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub request_id: String,
    pub thread_id: String,
    pub triggering_message_id: String,
    pub context: Vec<ContextBlock>,
}

/// Tool result injected when resuming a suspended turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResumption {
    pub tool_call_id: String,
    pub tool_name: String,
    pub outcome: ToolOutcome,
}

/// Incremental model output. A turn is a sequence of deltas and
/// tool-use blocks terminated by `EndOfTurn` or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelEvent {
    TextDelta { text: String },
    ToolUse { tool_name: String, input: Value },
    EndOfTurn { total_tokens: i64 },
}

pub trait ModelStream {
    fn next_event(&mut self) -> Result<ModelEvent, ModelError>;
}

/// Black-box model capability. `resume_turn` continues a turn that
/// suspended on a tool-use block, with the tool's outcome injected.
pub trait ModelClient {
    fn start_turn(&self, request: &TurnRequest) -> Result<Box<dyn ModelStream>, ModelError>;
    fn resume_turn(
        &self,
        request: &TurnRequest,
        resumption: &ToolResumption,
    ) -> Result<Box<dyn ModelStream>, ModelError>;
}

impl<T: ModelClient + ?Sized> ModelClient for &T {
    fn start_turn(&self, request: &TurnRequest) -> Result<Box<dyn ModelStream>, ModelError> {
        (**self).start_turn(request)
    }

    fn resume_turn(
        &self,
        request: &TurnRequest,
        resumption: &ToolResumption,
    ) -> Result<Box<dyn ModelStream>, ModelError> {
        (**self).resume_turn(request, resumption)
    }
}

/// Scripted client: each `start_turn`/`resume_turn` pops the next
/// queued segment. Drives the engine in tests and offline rehearsal.
#[derive(Default)]
pub struct ScriptedModelClient {
    segments: Mutex<VecDeque<Vec<Result<ModelEvent, ModelError>>>>,
    resumptions: Mutex<Vec<ToolResumption>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_segment(&self, events: Vec<Result<ModelEvent, ModelError>>) {
        self.segments
            .lock()
            .expect("segment queue poisoned")
            .push_back(events);
    }

    /// Resumptions the engine injected, in order. Lets tests assert
    /// what the model was told about each tool outcome.
    pub fn recorded_resumptions(&self) -> Vec<ToolResumption> {
        self.resumptions
            .lock()
            .expect("resumption log poisoned")
            .clone()
    }

    fn next_segment(&self) -> Result<Box<dyn ModelStream>, ModelError> {
        let segment = self
            .segments
            .lock()
            .expect("segment queue poisoned")
            .pop_front()
            .ok_or_else(|| ModelError::Fatal("scripted client has no segment queued".to_string()))?;
        Ok(Box::new(ScriptedStream {
            events: segment.into_iter().collect(),
        }))
    }
}

impl ModelClient for ScriptedModelClient {
    fn start_turn(&self, _request: &TurnRequest) -> Result<Box<dyn ModelStream>, ModelError> {
        self.next_segment()
    }

    fn resume_turn(
        &self,
        _request: &TurnRequest,
        resumption: &ToolResumption,
    ) -> Result<Box<dyn ModelStream>, ModelError> {
        self.resumptions
            .lock()
            .expect("resumption log poisoned")
            .push(resumption.clone());
        self.next_segment()
    }
}

struct ScriptedStream {
    events: VecDeque<Result<ModelEvent, ModelError>>,
}

impl ModelStream for ScriptedStream {
    fn next_event(&mut self) -> Result<ModelEvent, ModelError> {
        self.events
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Fatal("scripted segment exhausted".to_string())))
    }
}
