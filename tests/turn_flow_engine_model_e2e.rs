use draftloom::approval::{ApprovalStatus, PendingScope};
use draftloom::config::Settings;
use draftloom::context::ContextAssembler;
use draftloom::index::{EmbedderGateway, HashEmbedderClient, RetryPolicy};
use draftloom::model::{ModelError, ModelEvent, ScriptedModelClient};
use draftloom::request::{AgentEngine, EngineError, EventPayload, RequestState};
use draftloom::store::Store;
use draftloom::threads::ThreadRepository;
use draftloom::tools::{ToolError, ToolExecutor, ToolInput, ToolOutcome};
use serde_json::json;
use std::sync::Mutex;
use tempfile::tempdir;

#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<ToolInput>>,
}

impl RecordingExecutor {
    fn call_count(&self) -> usize {
        self.calls.lock().expect("calls").len()
    }
}

impl ToolExecutor for RecordingExecutor {
    fn execute(&self, input: &ToolInput) -> Result<serde_json::Value, ToolError> {
        self.calls.lock().expect("calls").push(input.clone());
        Ok(json!({ "ok": true }))
    }
}

type TestEngine<'a> =
    AgentEngine<&'a ScriptedModelClient, HashEmbedderClient, &'a RecordingExecutor>;

fn engine_with<'a>(
    dir: &std::path::Path,
    settings: Settings,
    client: &'a ScriptedModelClient,
    executor: &'a RecordingExecutor,
) -> TestEngine<'a> {
    let store = Store::open(&dir.join("state/draftloom.db")).expect("open store");
    store.ensure_schema().expect("schema");
    ThreadRepository::new(store.clone())
        .create_thread("t1", None, "", 100)
        .expect("thread");
    let assembler = ContextAssembler::new(
        store.clone(),
        EmbedderGateway::new(HashEmbedderClient::new(), RetryPolicy::default()),
        settings.semantic_top_k,
    );
    AgentEngine::new(store, dir, settings, client, assembler, executor)
}

fn text(text: &str) -> Result<ModelEvent, ModelError> {
    Ok(ModelEvent::TextDelta {
        text: text.to_string(),
    })
}

fn tool_use(name: &str, input: serde_json::Value) -> Result<ModelEvent, ModelError> {
    Ok(ModelEvent::ToolUse {
        tool_name: name.to_string(),
        input,
    })
}

fn end_of_turn(total_tokens: i64) -> Result<ModelEvent, ModelError> {
    Ok(ModelEvent::EndOfTurn { total_tokens })
}

#[test]
fn a_plain_text_turn_streams_chunks_and_completes() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![text("Hello, "), text("world"), end_of_turn(42)]);

    let request = engine.submit("t1", "msg-1", "say hello", 100).expect("submit");
    assert_eq!(request.status, RequestState::Pending);

    let finished = engine.process(&request.request_id, 110).expect("process");
    assert_eq!(finished.status, RequestState::Completed);
    assert_eq!(finished.token_cost, Some(42));
    assert!(finished.response_message_id.is_some());
    assert!((finished.progress - 1.0).abs() < f64::EPSILON);
    assert_eq!(finished.completed_at, Some(110));

    let status = engine.get_status(&request.request_id).expect("status");
    assert!(!status.can_resume);
    let types: Vec<&str> = status
        .events
        .iter()
        .map(|event| event.payload.type_name())
        .collect();
    assert_eq!(
        types,
        vec!["context_ready", "text_chunk", "text_chunk", "completion"]
    );
    assert_eq!(
        draftloom::request::transcript_text(&status.events),
        "Hello, world"
    );
}

#[test]
fn a_write_file_tool_use_suspends_the_turn_for_review() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![
        text("Drafting the plan. "),
        tool_use("write_file", json!({"path": "plan.md", "content": "v1"})),
    ]);

    let request = engine.submit("t1", "msg-1", "write a plan", 100).expect("submit");
    let suspended = engine.process(&request.request_id, 110).expect("process");
    assert_eq!(suspended.status, RequestState::InProgress);

    let status = engine.get_status(&request.request_id).expect("status");
    assert!(status.can_resume, "suspension is resumable");

    let pending = engine
        .list_pending(&PendingScope::Request(request.request_id.clone()))
        .expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].approval_status, ApprovalStatus::Pending);
    assert_eq!(pending[0].tool_name, "write_file");

    let tool_call_event = status
        .events
        .iter()
        .find_map(|event| match &event.payload {
            EventPayload::ToolCall {
                tool_call_id,
                preview,
                ..
            } => Some((tool_call_id.clone(), preview.clone())),
            _ => None,
        })
        .expect("tool_call event appended");
    assert_eq!(tool_call_event.0, pending[0].tool_call_id);
    assert!(tool_call_event.1.starts_with("write_file plan.md"));
    assert_eq!(executor.call_count(), 0, "nothing runs before approval");
}

#[test]
fn approval_executes_the_tool_once_and_resumes_the_turn() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![
        text("Drafting. "),
        tool_use("write_file", json!({"path": "plan.md", "content": "v1"})),
    ]);

    let request = engine.submit("t1", "msg-1", "write a plan", 100).expect("submit");
    engine.process(&request.request_id, 110).expect("process");
    let pending = engine
        .list_pending(&PendingScope::Request(request.request_id.clone()))
        .expect("pending");
    let tool_call_id = pending[0].tool_call_id.clone();

    client.push_segment(vec![text("Saved."), end_of_turn(64)]);
    let resolved = engine
        .resolve_tool_call(&tool_call_id, true, None, None, 120)
        .expect("approve");
    assert_eq!(resolved.approval_status, ApprovalStatus::Approved);
    assert_eq!(executor.call_count(), 1);

    let resumptions = client.recorded_resumptions();
    assert_eq!(resumptions.len(), 1);
    assert_eq!(resumptions[0].tool_call_id, tool_call_id);
    assert!(matches!(resumptions[0].outcome, ToolOutcome::Success { .. }));

    let status = engine.get_status(&request.request_id).expect("status");
    assert_eq!(status.request.status, RequestState::Completed);
    let types: Vec<&str> = status
        .events
        .iter()
        .map(|event| event.payload.type_name())
        .collect();
    assert_eq!(
        types,
        vec![
            "context_ready",
            "text_chunk",
            "tool_call",
            "tool_result",
            "text_chunk",
            "completion"
        ]
    );

    // A duplicate approval neither re-executes nor re-resumes.
    let again = engine
        .resolve_tool_call(&tool_call_id, true, None, None, 130)
        .expect("duplicate approve");
    assert_eq!(again.approval_status, ApprovalStatus::Approved);
    assert_eq!(executor.call_count(), 1, "tool ran exactly once");
    assert_eq!(client.recorded_resumptions().len(), 1);
}

#[test]
fn rejection_resumes_the_turn_with_a_decline() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![tool_use(
        "delete_file",
        json!({"path": "archive.md"}),
    )]);

    let request = engine.submit("t1", "msg-1", "clean up", 100).expect("submit");
    engine.process(&request.request_id, 110).expect("process");
    let tool_call_id = engine
        .list_pending(&PendingScope::Request(request.request_id.clone()))
        .expect("pending")[0]
        .tool_call_id
        .clone();

    client.push_segment(vec![text("Understood, leaving it."), end_of_turn(12)]);
    let resolved = engine
        .resolve_tool_call(&tool_call_id, false, Some("keep the archive"), None, 120)
        .expect("reject");
    assert_eq!(resolved.approval_status, ApprovalStatus::Rejected);
    assert_eq!(executor.call_count(), 0, "rejected call never runs");

    let resumptions = client.recorded_resumptions();
    assert_eq!(resumptions.len(), 1);
    assert!(matches!(
        &resumptions[0].outcome,
        ToolOutcome::Declined { reason: Some(reason) } if reason == "keep the archive"
    ));

    let status = engine.get_status(&request.request_id).expect("status");
    assert_eq!(status.request.status, RequestState::Completed);
    let declined = status
        .events
        .iter()
        .find_map(|event| match &event.payload {
            EventPayload::ToolResult { outcome, .. } => Some(outcome.clone()),
            _ => None,
        })
        .expect("tool_result recorded");
    assert!(matches!(declined, ToolOutcome::Declined { .. }));
}

#[test]
fn reject_then_revise_returns_the_call_to_review() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![tool_use(
        "write_file",
        json!({"path": "wrong/place.md", "content": "v1"}),
    )]);

    let request = engine.submit("t1", "msg-1", "save notes", 100).expect("submit");
    engine.process(&request.request_id, 110).expect("process");
    let tool_call_id = engine
        .list_pending(&PendingScope::Request(request.request_id.clone()))
        .expect("pending")[0]
        .tool_call_id
        .clone();

    client.push_segment(vec![text("Okay."), end_of_turn(8)]);
    engine
        .resolve_tool_call(&tool_call_id, false, Some("wrong path"), None, 120)
        .expect("reject");

    let corrected = ToolInput::WriteFile {
        path: "notes/place.md".to_string(),
        content: "v1".to_string(),
    };
    let revised = engine
        .resolve_tool_call(&tool_call_id, false, Some("corrected"), Some(corrected.clone()), 130)
        .expect("revise");
    assert_eq!(revised.approval_status, ApprovalStatus::Pending);
    assert_eq!(revised.revision_count, 1);
    assert_eq!(revised.revision_history.len(), 1);
    assert_eq!(revised.tool_input, corrected);

    // Approving the revived call applies the corrected mutation even
    // though the original turn already closed.
    let approved = engine
        .resolve_tool_call(&tool_call_id, true, None, None, 140)
        .expect("approve revision");
    assert_eq!(approved.approval_status, ApprovalStatus::Approved);
    assert_eq!(executor.call_count(), 1);
    assert_eq!(
        executor.calls.lock().expect("calls")[0],
        corrected,
        "the corrected input ran, not the original"
    );
}

#[test]
fn read_only_tools_run_inline_without_suspension() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![tool_use(
        "search_documents",
        json!({"query": "branch history"}),
    )]);
    client.push_segment(vec![text("Found it."), end_of_turn(20)]);

    let request = engine.submit("t1", "msg-1", "find notes", 100).expect("submit");
    let finished = engine.process(&request.request_id, 110).expect("process");
    assert_eq!(finished.status, RequestState::Completed);
    assert_eq!(executor.call_count(), 1);
    assert!(engine
        .list_pending(&PendingScope::Request(request.request_id.clone()))
        .expect("pending")
        .is_empty());

    let status = engine.get_status(&request.request_id).expect("status");
    let types: Vec<&str> = status
        .events
        .iter()
        .map(|event| event.payload.type_name())
        .collect();
    assert_eq!(
        types,
        vec!["context_ready", "tool_result", "text_chunk", "completion"],
        "read-only use records a result but no tool_call suspension"
    );
}

#[test]
fn unknown_tools_are_parked_for_review() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![tool_use("summon_dragon", json!({"size": 9}))]);

    let request = engine.submit("t1", "msg-1", "do a thing", 100).expect("submit");
    engine.process(&request.request_id, 110).expect("process");

    let pending = engine
        .list_pending(&PendingScope::Request(request.request_id.clone()))
        .expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tool_name, "summon_dragon");
    assert_eq!(executor.call_count(), 0);
}

#[test]
fn a_fatal_model_error_fails_the_request_with_an_error_event() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![
        text("partial answer"),
        Err(ModelError::Fatal("model exploded".to_string())),
    ]);

    let request = engine.submit("t1", "msg-1", "hello", 100).expect("submit");
    let err = engine
        .process(&request.request_id, 110)
        .expect_err("must fail");
    assert!(matches!(err, EngineError::FatalExecution { .. }));

    let status = engine.get_status(&request.request_id).expect("status");
    assert_eq!(status.request.status, RequestState::Failed);
    assert!(!status.can_resume);
    let last = status.events.last().expect("events recorded");
    assert!(matches!(
        &last.payload,
        EventPayload::Error { message, .. } if message.contains("model exploded")
    ));
}

#[test]
fn a_transient_error_before_output_is_retried() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![Err(ModelError::Transient("blip".to_string()))]);
    client.push_segment(vec![text("Recovered."), end_of_turn(10)]);

    let request = engine.submit("t1", "msg-1", "hello", 100).expect("submit");
    let finished = engine.process(&request.request_id, 110).expect("process");
    assert_eq!(finished.status, RequestState::Completed);
    assert_eq!(
        draftloom::request::transcript_text(
            &engine.get_status(&request.request_id).expect("status").events
        ),
        "Recovered."
    );
}

#[test]
fn malformed_tool_input_fails_the_request_as_validation() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    // write_file with a missing `content` field.
    client.push_segment(vec![tool_use("write_file", json!({"path": "plan.md"}))]);

    let request = engine.submit("t1", "msg-1", "hello", 100).expect("submit");
    engine
        .process(&request.request_id, 110)
        .expect_err("must fail");

    let status = engine.get_status(&request.request_id).expect("status");
    assert_eq!(status.request.status, RequestState::Failed);
    let last = status.events.last().expect("events");
    assert!(matches!(
        &last.payload,
        EventPayload::Error { code: Some(code), .. } if code == "validation"
    ));
}

#[test]
fn the_tool_depth_limit_terminates_a_runaway_turn() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let settings = Settings {
        max_tool_calls_per_request: 1,
        ..Settings::default()
    };
    let engine = engine_with(dir.path(), settings, &client, &executor);

    client.push_segment(vec![tool_use("read_file", json!({"path": "a.md"}))]);
    client.push_segment(vec![tool_use("read_file", json!({"path": "b.md"}))]);

    let request = engine.submit("t1", "msg-1", "loop forever", 100).expect("submit");
    engine
        .process(&request.request_id, 110)
        .expect_err("depth limit");

    let status = engine.get_status(&request.request_id).expect("status");
    assert_eq!(status.request.status, RequestState::Failed);
    assert_eq!(executor.call_count(), 1, "only the first use ran");
    let last = status.events.last().expect("events");
    assert!(matches!(
        &last.payload,
        EventPayload::Error { code: Some(code), .. } if code == "tool_depth"
    ));
}

#[test]
fn a_second_submit_while_active_conflicts() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    engine.submit("t1", "msg-1", "first", 100).expect("first");
    let err = engine
        .submit("t1", "msg-2", "second", 110)
        .expect_err("conflict");
    assert!(matches!(err, EngineError::Conflict { .. }));
}

#[test]
fn status_replay_is_identical_across_reconnects() {
    let dir = tempdir().expect("tempdir");
    let client = ScriptedModelClient::new();
    let executor = RecordingExecutor::default();
    let engine = engine_with(dir.path(), Settings::default(), &client, &executor);

    client.push_segment(vec![
        text("alpha "),
        text("beta "),
        text("gamma"),
        end_of_turn(30),
    ]);

    let request = engine.submit("t1", "msg-1", "spell it", 100).expect("submit");
    engine.process(&request.request_id, 110).expect("process");

    let first = engine.get_status(&request.request_id).expect("status");
    let second = engine.get_status(&request.request_id).expect("status");
    assert_eq!(first.events, second.events, "replay is deterministic");

    let sequences: Vec<i64> = first.events.iter().map(|event| event.sequence).collect();
    let expected: Vec<i64> = (1..=first.events.len() as i64).collect();
    assert_eq!(sequences, expected, "no gaps, no duplicates");
}
