use crate::approval::{
    ApprovalError, PendingScope, PendingToolCall, ToolApprovalGate,
};
use crate::config::Settings;
use crate::context::assembler::{AssembledContext, ContextAssembler, ContextError};
use crate::index::embedder::EmbedderClient;
use crate::model::{
    ContextBlock, ModelClient, ModelError, ModelEvent, ModelStream, ToolResumption, TurnRequest,
};
use crate::request::domain::{AgentRequest, RequestState};
use crate::request::events::{transcript_text, EventPayload, ExecutionEvent};
use crate::request::store::{RequestStore, RequestStoreError};
use crate::shared::ids::generate_id;
use crate::shared::logging::append_agent_event;
use crate::store::Store;
use crate::tools::{preview, ToolExecutor, ToolInput, ToolOutcome};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("an agent request is already active for thread `{thread_id}`")]
    Conflict { thread_id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("agent request `{request_id}` failed: {message}")]
    FatalExecution { request_id: String, message: String },
    #[error("request store error: {0}")]
    RequestStore(#[from] RequestStoreError),
    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),
    #[error("context assembly error: {0}")]
    Context(#[from] ContextError),
    #[error("failed to append agent log: {source}")]
    Log {
        #[source]
        source: std::io::Error,
    },
}

/// Authoritative view for a reconnecting client: the request row, the
/// computed resumability flag, and the full ordered event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestStatus {
    pub request: AgentRequest,
    pub can_resume: bool,
    pub events: Vec<ExecutionEvent>,
}

enum Acquire {
    Start,
    Resume(ToolResumption),
}

/// The top-level orchestrator for one agent turn: assembles context,
/// drives the model stream into the event log, parks mutating tool
/// calls at the approval gate, and finalizes the request. All state
/// lives in the store; a suspension holds no threads or locks.
pub struct AgentEngine<M, C, X> {
    settings: Settings,
    state_root: PathBuf,
    requests: RequestStore,
    gate: ToolApprovalGate,
    assembler: ContextAssembler<C>,
    model: M,
    executor: X,
}

impl<M: ModelClient, C: EmbedderClient, X: ToolExecutor> AgentEngine<M, C, X> {
    pub fn new(
        store: Store,
        state_root: impl Into<PathBuf>,
        settings: Settings,
        model: M,
        assembler: ContextAssembler<C>,
        executor: X,
    ) -> Self {
        Self {
            settings,
            state_root: state_root.into(),
            requests: RequestStore::new(store.clone()),
            gate: ToolApprovalGate::new(store),
            assembler,
            model,
            executor,
        }
    }

    pub fn submit(
        &self,
        thread_id: &str,
        triggering_message_id: &str,
        message_text: &str,
        now: i64,
    ) -> Result<AgentRequest, EngineError> {
        let request = match self
            .requests
            .create(thread_id, triggering_message_id, message_text, now)
        {
            Ok(request) => request,
            Err(RequestStoreError::Conflict { thread_id }) => {
                return Err(EngineError::Conflict { thread_id });
            }
            Err(RequestStoreError::UnknownThread { thread_id }) => {
                return Err(EngineError::Validation(format!(
                    "unknown thread `{thread_id}`"
                )));
            }
            Err(RequestStoreError::Validation(reason)) => {
                return Err(EngineError::Validation(reason));
            }
            Err(other) => return Err(other.into()),
        };

        self.log(
            now,
            "request.submitted",
            &[
                ("request_id", Value::String(request.request_id.clone())),
                ("thread_id", Value::String(thread_id.to_string())),
            ],
        )?;
        Ok(request)
    }

    /// Run a freshly submitted request until it completes, fails, or
    /// suspends on a mutating tool call.
    pub fn process(&self, request_id: &str, now: i64) -> Result<AgentRequest, EngineError> {
        let request = self.requests.transition(request_id, RequestState::InProgress, now)?;

        let assembled = match self.assembler.assemble(
            &request.thread_id,
            self.settings.context_token_budget,
            &request.triggering_message_text,
        ) {
            Ok(assembled) => assembled,
            Err(err) => {
                return Err(self.fail_with_error(
                    request_id,
                    &format!("context assembly failed: {err}"),
                    Some("context"),
                    now,
                )?);
            }
        };

        self.requests.append_event(
            request_id,
            &EventPayload::ContextReady {
                document_count: assembled.summary.document_count,
                assembled_chars: assembled.summary.assembled_chars,
                token_count: assembled.summary.token_count,
            },
            now,
        )?;
        self.requests.update_progress(request_id, 0.1)?;
        if assembled.overflow {
            self.log(
                now,
                "context.overflow",
                &[("request_id", Value::String(request_id.to_string()))],
            )?;
        }

        let turn = turn_request(&request, &assembled);
        self.drive(&request, &turn, Acquire::Start, now)
    }

    /// Resolve a parked tool call. Approval executes the tool and
    /// resumes the model with its result; rejection resumes the model
    /// with a decline; a revised input returns the call to review
    /// without touching the model.
    pub fn resolve_tool_call(
        &self,
        tool_call_id: &str,
        approved: bool,
        reason: Option<&str>,
        revised_input: Option<ToolInput>,
        now: i64,
    ) -> Result<PendingToolCall, EngineError> {
        if let Some(new_input) = revised_input {
            new_input
                .validate()
                .map_err(|err| EngineError::Validation(err.to_string()))?;
            let call = self.gate.revise(tool_call_id, &new_input, reason, now)?;
            self.log(
                now,
                "tool.revised",
                &[
                    ("tool_call_id", Value::String(tool_call_id.to_string())),
                    ("revision_count", Value::from(call.revision_count)),
                ],
            )?;
            return Ok(call);
        }

        let resolution = if approved {
            self.gate.approve(tool_call_id, now)?
        } else {
            self.gate.reject(tool_call_id, reason, now)?
        };
        if !resolution.newly_resolved {
            // Duplicate retry: report the stored outcome, run nothing.
            return Ok(resolution.call);
        }

        let call = resolution.call;
        let request = self.requests.load(&call.request_id)?;

        let outcome = if approved {
            match self.executor.execute(&call.tool_input) {
                Ok(result) => ToolOutcome::Success { result },
                Err(err) => ToolOutcome::Failed {
                    message: err.to_string(),
                },
            }
        } else {
            ToolOutcome::Declined {
                reason: reason.map(str::to_string),
            }
        };

        if request.status != RequestState::InProgress {
            // The turn already closed (a rejection resumed the model
            // and it finished before this call came back through
            // revision). The approved mutation still applies, but the
            // closed transcript stays immutable.
            self.log(
                now,
                "tool.resolved_after_turn",
                &[
                    ("tool_call_id", Value::String(call.tool_call_id.clone())),
                    (
                        "decision",
                        Value::String(if approved { "approved" } else { "rejected" }.to_string()),
                    ),
                ],
            )?;
            return Ok(call);
        }

        self.requests.append_event(
            &call.request_id,
            &EventPayload::ToolResult {
                tool_call_id: Some(call.tool_call_id.clone()),
                tool_name: call.tool_name.clone(),
                outcome: outcome.clone(),
            },
            now,
        )?;
        self.log(
            now,
            "tool.resolved",
            &[
                ("tool_call_id", Value::String(call.tool_call_id.clone())),
                (
                    "decision",
                    Value::String(if approved { "approved" } else { "rejected" }.to_string()),
                ),
            ],
        )?;

        // Context was delivered when the turn started; resumption
        // relies on the provider's session continuity.
        let turn = TurnRequest {
            request_id: request.request_id.clone(),
            thread_id: request.thread_id.clone(),
            triggering_message_id: request.triggering_message_id.clone(),
            context: Vec::new(),
        };
        let resumption = ToolResumption {
            tool_call_id: call.tool_call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome,
        };
        self.drive(&request, &turn, Acquire::Resume(resumption), now)?;
        Ok(self.gate.load(tool_call_id)?)
    }

    pub fn list_pending(&self, scope: &PendingScope) -> Result<Vec<PendingToolCall>, EngineError> {
        Ok(self.gate.list_pending(scope)?)
    }

    /// The recovery query: replays the event log so a reconnecting
    /// client reconstructs exactly what was streamed.
    pub fn get_status(&self, request_id: &str) -> Result<RequestStatus, EngineError> {
        let request = self.requests.load(request_id)?;
        let events = self.requests.events(request_id)?;
        let pending = self
            .gate
            .list_pending(&PendingScope::Request(request_id.to_string()))?;
        let has_terminal = events.iter().any(|event| event.payload.is_terminal());
        let can_resume = request.status.is_active() && (!pending.is_empty() || !has_terminal);
        Ok(RequestStatus {
            request,
            can_resume,
            events,
        })
    }

    /// Diagnostics surface; request processing assembles internally.
    pub fn assembled_context(
        &self,
        thread_id: &str,
        budget_tokens: usize,
        query_text: &str,
    ) -> Result<AssembledContext, EngineError> {
        Ok(self.assembler.assemble(thread_id, budget_tokens, query_text)?)
    }

    fn drive(
        &self,
        request: &AgentRequest,
        turn: &TurnRequest,
        acquire: Acquire,
        now: i64,
    ) -> Result<AgentRequest, EngineError> {
        let request_id = request.request_id.as_str();
        let clock = Instant::now();
        let mut attempts_left = self.settings.model_retry_attempts;
        let mut last_acquire = acquire;
        let mut emitted_since_acquire = false;
        let mut text_chunks = self.requests.count_events_of_type(request_id, "text_chunk")?;
        let mut tool_depth = self.tool_use_depth(request_id)?;

        let mut stream = match self.acquire_stream(turn, &last_acquire, &mut attempts_left) {
            Ok(stream) => stream,
            Err(err) => {
                return Err(self.fail_with_error(
                    request_id,
                    &format!("model call failed: {err}"),
                    Some("model"),
                    now,
                )?);
            }
        };

        loop {
            if clock.elapsed().as_secs() > self.settings.request_wall_clock_seconds {
                return Err(self.fail_with_error(
                    request_id,
                    "request exceeded wall-clock budget",
                    Some("wall_clock"),
                    now,
                )?);
            }

            match stream.next_event() {
                Ok(ModelEvent::TextDelta { text }) => {
                    emitted_since_acquire = true;
                    self.requests
                        .append_event(request_id, &EventPayload::TextChunk { text }, now)?;
                    text_chunks += 1;
                    let streamed = text_chunks as f64;
                    self.requests
                        .update_progress(request_id, 0.1 + 0.8 * streamed / (streamed + 25.0))?;
                }
                Ok(ModelEvent::ToolUse { tool_name, input }) => {
                    emitted_since_acquire = true;
                    tool_depth += 1;
                    if tool_depth > i64::from(self.settings.max_tool_calls_per_request) {
                        return Err(self.fail_with_error(
                            request_id,
                            "request exceeded maximum tool-call depth",
                            Some("tool_depth"),
                            now,
                        )?);
                    }

                    let parsed = match ToolInput::from_call(&tool_name, input)
                        .and_then(|parsed| parsed.validate().map(|()| parsed))
                    {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            return Err(self.fail_with_error(
                                request_id,
                                &format!("invalid tool input: {err}"),
                                Some("validation"),
                                now,
                            )?);
                        }
                    };

                    let tool_call_id =
                        generate_id("call", now).map_err(EngineError::Validation)?;
                    if parsed.is_mutating() {
                        self.requests.append_event(
                            request_id,
                            &EventPayload::ToolCall {
                                tool_call_id: tool_call_id.clone(),
                                tool_name: parsed.name().to_string(),
                                tool_input: parsed.clone(),
                                preview: preview(&parsed),
                            },
                            now,
                        )?;
                        self.gate
                            .create_pending(&tool_call_id, request_id, &parsed, now)?;
                        self.log(
                            now,
                            "request.suspended",
                            &[
                                ("request_id", Value::String(request_id.to_string())),
                                ("tool_call_id", Value::String(tool_call_id)),
                                ("tool_name", Value::String(parsed.name().to_string())),
                            ],
                        )?;
                        return Ok(self.requests.load(request_id)?);
                    }

                    // Read-only tools run inline; the turn continues
                    // with the outcome injected.
                    let outcome = match self.executor.execute(&parsed) {
                        Ok(result) => ToolOutcome::Success { result },
                        Err(err) => ToolOutcome::Failed {
                            message: err.to_string(),
                        },
                    };
                    self.requests.append_event(
                        request_id,
                        &EventPayload::ToolResult {
                            tool_call_id: Some(tool_call_id.clone()),
                            tool_name: parsed.name().to_string(),
                            outcome: outcome.clone(),
                        },
                        now,
                    )?;
                    last_acquire = Acquire::Resume(ToolResumption {
                        tool_call_id,
                        tool_name: parsed.name().to_string(),
                        outcome,
                    });
                    emitted_since_acquire = false;
                    stream = match self.acquire_stream(turn, &last_acquire, &mut attempts_left) {
                        Ok(stream) => stream,
                        Err(err) => {
                            return Err(self.fail_with_error(
                                request_id,
                                &format!("model call failed: {err}"),
                                Some("model"),
                                now,
                            )?);
                        }
                    };
                }
                Ok(ModelEvent::EndOfTurn { total_tokens }) => {
                    return self.finalize(request_id, total_tokens, clock, now);
                }
                Err(err) if err.is_transient() && !emitted_since_acquire && attempts_left > 0 => {
                    attempts_left -= 1;
                    stream = match self.acquire_stream(turn, &last_acquire, &mut attempts_left) {
                        Ok(stream) => stream,
                        Err(err) => {
                            return Err(self.fail_with_error(
                                request_id,
                                &format!("model call failed: {err}"),
                                Some("model"),
                                now,
                            )?);
                        }
                    };
                }
                Err(err) => {
                    return Err(self.fail_with_error(
                        request_id,
                        &format!("model failure: {err}"),
                        Some("model"),
                        now,
                    )?);
                }
            }
        }
    }

    fn finalize(
        &self,
        request_id: &str,
        total_tokens: i64,
        clock: Instant,
        now: i64,
    ) -> Result<AgentRequest, EngineError> {
        let message_id = generate_id("msg", now).map_err(EngineError::Validation)?;
        let execution_time_ms = clock.elapsed().as_millis() as i64;
        self.requests.append_event(
            request_id,
            &EventPayload::Completion {
                message_id: message_id.clone(),
                total_tokens,
                execution_time_ms,
            },
            now,
        )?;

        let events = self.requests.events(request_id)?;
        let tool_summaries: Vec<Value> = self
            .gate
            .list_for_request(request_id)?
            .into_iter()
            .map(|call| {
                json!({
                    "toolCallId": call.tool_call_id,
                    "toolName": call.tool_name,
                    "status": call.approval_status,
                    "revisionCount": call.revision_count,
                })
            })
            .collect();
        let results = json!({
            "messageId": message_id,
            "content": transcript_text(&events),
            "toolSummaries": tool_summaries,
        });

        let completed = self
            .requests
            .complete(request_id, &message_id, &results, total_tokens, now)?;
        self.log(
            now,
            "request.completed",
            &[
                ("request_id", Value::String(request_id.to_string())),
                ("total_tokens", Value::from(total_tokens)),
            ],
        )?;
        Ok(completed)
    }

    fn acquire_stream(
        &self,
        turn: &TurnRequest,
        acquire: &Acquire,
        attempts_left: &mut u32,
    ) -> Result<Box<dyn ModelStream>, ModelError> {
        loop {
            let result = match acquire {
                Acquire::Start => self.model.start_turn(turn),
                Acquire::Resume(resumption) => self.model.resume_turn(turn, resumption),
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(err) if err.is_transient() && *attempts_left > 0 => {
                    *attempts_left -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Records the terminal error event, fails the request, and hands
    /// back the error for the caller to return. Never swallows: if
    /// recording itself fails, that failure wins.
    fn fail_with_error(
        &self,
        request_id: &str,
        message: &str,
        code: Option<&str>,
        now: i64,
    ) -> Result<EngineError, EngineError> {
        self.requests.append_event(
            request_id,
            &EventPayload::Error {
                message: message.to_string(),
                code: code.map(str::to_string),
            },
            now,
        )?;
        let current = self.requests.load(request_id)?;
        if !current.status.is_terminal() {
            self.requests
                .transition(request_id, RequestState::Failed, now)?;
        }
        self.log(
            now,
            "request.failed",
            &[
                ("request_id", Value::String(request_id.to_string())),
                ("message", Value::String(message.to_string())),
            ],
        )?;
        Ok(EngineError::FatalExecution {
            request_id: request_id.to_string(),
            message: message.to_string(),
        })
    }

    /// Tool-use blocks processed so far: mutating calls (each has a
    /// pending row) plus inline read-only results.
    fn tool_use_depth(&self, request_id: &str) -> Result<i64, EngineError> {
        let tool_calls = self.requests.count_events_of_type(request_id, "tool_call")?;
        let tool_results = self
            .requests
            .count_events_of_type(request_id, "tool_result")?;
        let resolved = self.gate.count_resolved_for_request(request_id)?;
        Ok(tool_calls + (tool_results - resolved))
    }

    fn log(&self, now: i64, event: &str, fields: &[(&str, Value)]) -> Result<(), EngineError> {
        append_agent_event(&self.state_root, now, event, fields)
            .map_err(|source| EngineError::Log { source })
    }
}

fn turn_request(request: &AgentRequest, assembled: &AssembledContext) -> TurnRequest {
    TurnRequest {
        request_id: request.request_id.clone(),
        thread_id: request.thread_id.clone(),
        triggering_message_id: request.triggering_message_id.clone(),
        context: assembled
            .references
            .iter()
            .map(|item| ContextBlock {
                label: item.reference.display_label.clone(),
                content: item.content.clone(),
            })
            .collect(),
    }
}
