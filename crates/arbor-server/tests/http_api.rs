use arbor_agent_loop::{
    AgentIdentity, LlmEventStream, LlmExecutor, StaticModelResolver, Tool, ToolContext,
    ToolDescriptor, ToolError, ToolRegistry, TurnError, TurnRunner,
};
use arbor_chat_model::Message;
use arbor_chat_store::ChatStore;
use arbor_server::http::{router, AppState};
use async_trait::async_trait;
use axum::body::to_bytes;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use genai::chat::{
    ChatOptions, ChatRequest, ChatStreamEvent, MessageContent, StreamChunk, StreamEnd, Usage,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

type Script = Vec<Result<ChatStreamEvent, TurnError>>;

struct ScriptedExecutor {
    scripts: Mutex<VecDeque<Script>>,
    hang_after_script: bool,
}

impl ScriptedExecutor {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            hang_after_script: false,
        })
    }

    fn hanging(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            hang_after_script: true,
        })
    }
}

#[async_trait]
impl LlmExecutor for ScriptedExecutor {
    async fn exec_chat_stream_events(
        &self,
        _model: &str,
        _chat_req: ChatRequest,
        _options: Option<&ChatOptions>,
    ) -> Result<LlmEventStream, TurnError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TurnError::UpstreamModel("script exhausted".to_string()))?;
        if self.hang_after_script {
            Ok(Box::pin(
                futures::stream::iter(script).chain(futures::stream::pending()),
            ))
        } else {
            Ok(Box::pin(futures::stream::iter(script)))
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

fn text_event(content: &str) -> Result<ChatStreamEvent, TurnError> {
    Ok(ChatStreamEvent::Chunk(StreamChunk {
        content: content.to_string(),
    }))
}

fn end_event() -> Result<ChatStreamEvent, TurnError> {
    Ok(ChatStreamEvent::End(StreamEnd {
        captured_usage: Some(Usage {
            prompt_tokens: Some(10),
            prompt_tokens_details: None,
            completion_tokens: Some(4),
            completion_tokens_details: None,
            total_tokens: Some(14),
        }),
        ..Default::default()
    }))
}

fn end_with_calls(calls: Vec<genai::chat::ToolCall>) -> Result<ChatStreamEvent, TurnError> {
    Ok(ChatStreamEvent::End(StreamEnd {
        captured_content: Some(MessageContent::from_tool_calls(calls)),
        ..Default::default()
    }))
}

fn err_event(message: &str) -> Result<ChatStreamEvent, TurnError> {
    Err(TurnError::UpstreamModel(message.to_string()))
}

fn shell_call(id: &str) -> genai::chat::ToolCall {
    genai::chat::ToolCall {
        call_id: id.to_string(),
        fn_name: "shell".to_string(),
        fn_arguments: json!({ "cmd": "ls" }),
        thought_signatures: None,
    }
}

struct GuardedTool;

#[async_trait]
impl Tool for GuardedTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("shell", "Runs a shell command.").with_approval()
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(json!({ "ran": true }))
    }
}

struct TestServer {
    app: axum::Router,
    store: Arc<ChatStore>,
    _dir: TempDir,
}

fn make_app_with(executor: Arc<ScriptedExecutor>, registry: ToolRegistry) -> TestServer {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ChatStore::new(dir.path()));
    let resolver = Arc::new(StaticModelResolver::new(
        "mock-model",
        executor as Arc<dyn LlmExecutor>,
    ));
    let runner = Arc::new(TurnRunner::new(
        store.clone(),
        resolver,
        Arc::new(registry),
        AgentIdentity::new("agent-main", "Arbor", "main"),
    ));
    TestServer {
        app: router(AppState::new(store.clone(), runner)),
        store,
        _dir: dir,
    }
}

fn make_app(scripts: Vec<Script>) -> TestServer {
    make_app_with(ScriptedExecutor::new(scripts), ToolRegistry::new())
}

fn seeded(id: &str, parent: Option<&str>, text: &str, created_at: u64) -> Message {
    let mut message = Message::user(text);
    message.id = id.to_string();
    message.parent_message_id = parent.map(str::to_string);
    message.created_at = created_at;
    message.updated_at = created_at;
    message
}

#[tokio::test]
async fn test_chat_streams_sse_and_persists_branch() {
    let server = make_app(vec![vec![
        text_event("Hel"),
        text_event("lo"),
        end_event(),
    ]]);

    let resp = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/sessions/s1/chat")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(json!({ "text": "hi" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(
        text.contains(r#""type":"start""#),
        "missing start event: {text}"
    );
    assert!(
        text.contains(r#""type":"text-start""#),
        "missing text-start: {text}"
    );
    assert!(
        text.contains(r#""delta":"Hel""#),
        "missing first delta: {text}"
    );
    assert!(
        text.contains(r#""type":"finish""#),
        "missing finish: {text}"
    );
    assert!(
        text.contains("data: [DONE]"),
        "stream should end with [DONE] trailer: {text}"
    );

    let events = sse_events(&text);
    assert_eq!(events[0]["type"], "start");
    let assistant_id = events[0]["messageId"].as_str().unwrap().to_string();

    let finish = events.last().unwrap();
    assert_eq!(finish["type"], "finish");
    assert_eq!(finish["finishReason"], "stop");
    let metadata = &finish["messageMetadata"];
    assert_eq!(metadata["usage"]["inputTokens"], 10);
    assert_eq!(metadata["usage"]["outputTokens"], 4);
    assert_eq!(metadata["usage"]["totalTokens"], 14);
    assert!(metadata["durationMs"].is_u64());
    assert_eq!(metadata["agent"]["id"], "agent-main");
    assert_eq!(metadata["agent"]["model"], "mock-model");

    let (status, view) =
        get_json(server.app.clone(), "/v1/sessions/s1/view?include_messages=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["leafMessageId"], assistant_id.as_str());
    assert_eq!(view["branchMessageIds"].as_array().unwrap().len(), 2);

    let messages = view["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["parts"][0], json!({ "type": "text", "text": "hi" }));
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["id"], assistant_id.as_str());
    assert_eq!(messages[1]["parentMessageId"], messages[0]["id"]);
    assert_eq!(
        messages[1]["parts"][0],
        json!({ "type": "text", "text": "Hello" })
    );
}

#[tokio::test]
async fn test_chat_sets_sse_headers_and_done_trailer() {
    let server = make_app(vec![vec![text_event("ok"), end_event()]]);

    let resp = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/sessions/s1/chat")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(json!({ "text": "hello" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        resp.headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(
        text.ends_with("data: [DONE]\n\n"),
        "stream should end with [DONE] trailer: {text}"
    );
}

// ============================================================================
// Helper: POST JSON and return (status, body_json)
// ============================================================================

async fn post_json(app: axum::Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn post_sse_text(app: axum::Router, uri: &str, payload: Value) -> (StatusCode, String) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    (status, text)
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn patch_json(app: axum::Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri(uri)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn delete_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(uri)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn sse_events(text: &str) -> Vec<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|payload| *payload != "[DONE]")
        .filter_map(|payload| serde_json::from_str::<Value>(payload).ok())
        .collect()
}

// ============================================================================
// Health endpoint
// ============================================================================

#[tokio::test]
async fn test_health_returns_200() {
    let server = make_app(vec![]);

    let resp = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ============================================================================
// POST /v1/sessions/:id/chat: validation
// ============================================================================

#[tokio::test]
async fn test_chat_without_text_or_answers_is_rejected() {
    let server = make_app(vec![]);

    let (status, body) = post_json(server.app.clone(), "/v1/sessions/s1/chat", json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]
            .as_str()
            .unwrap_or("")
            .contains("text or tool answers"),
        "expected input validation error: {body}"
    );

    // Whitespace-only text is treated as absent.
    let (status, _) = post_json(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "   " }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_malformed_json() {
    let server = make_app(vec![]);

    let resp = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/sessions/s1/chat")
                .header("content-type", "application/json")
                .body(axum::body::Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    // Axum returns 400 for JSON parse errors.
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_with_unknown_parent_is_rejected_before_streaming() {
    let server = make_app(vec![vec![text_event("never"), end_event()]]);

    let (status, body) = post_json(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "hi", "parentMessageId": "ghost" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(
        body["error"].as_str().unwrap_or("").contains("not found"),
        "expected not found error: {body}"
    );

    // Nothing was appended.
    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 0);
}

// ============================================================================
// POST /v1/sessions/:id/chat: turn variants
// ============================================================================

#[tokio::test]
async fn test_chat_model_override_reaches_metadata() {
    let server = make_app(vec![vec![end_event()]]);

    let (status, text) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "hi", "model": "provider/custom" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&text);
    let finish = events.last().unwrap();
    assert_eq!(finish["finishReason"], "stop");
    assert_eq!(finish["messageMetadata"]["agent"]["model"], "provider/custom");
}

#[tokio::test]
async fn test_chat_branches_from_explicit_parent() {
    let server = make_app(vec![
        vec![text_event("A!"), end_event()],
        vec![text_event("B!"), end_event()],
    ]);
    server
        .store
        .append_message("s1", seeded("m1", None, "root", 1))
        .await
        .unwrap();

    let (status, _) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "branch A" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Distinct timestamps keep sibling order deterministic.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let (status, text) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "branch B", "parentMessageId": "m1" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = sse_events(&text);
    let assistant_b = events[0]["messageId"].as_str().unwrap();

    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 5);

    // The default view follows the newest branch.
    let (status, view) = get_json(
        server.app.clone(),
        "/v1/sessions/s1/view?include_messages=true&include_sibling_nav=true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["leafMessageId"], assistant_b);
    let messages = view["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["id"], "m1");
    assert_eq!(messages[1]["parts"][0]["text"], "branch B");
    assert_eq!(messages[1]["parentMessageId"], "m1");

    let user_b = messages[1]["id"].as_str().unwrap();
    assert_eq!(view["siblingNav"][user_b]["siblingIndex"], 2);
    assert_eq!(view["siblingNav"][user_b]["siblingTotal"], 2);
}

// ============================================================================
// Approval flow: suspension and resume over HTTP
// ============================================================================

#[tokio::test]
async fn test_approval_resume_completes_suspended_turn() {
    let server = make_app_with(
        ScriptedExecutor::new(vec![
            vec![end_with_calls(vec![shell_call("c1")])],
            vec![text_event("done"), end_event()],
        ]),
        ToolRegistry::new().with(Arc::new(GuardedTool)),
    );

    let (status, text) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "run it" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&text);
    let suspended_id = events[0]["messageId"].as_str().unwrap().to_string();
    assert!(
        events
            .iter()
            .any(|e| e["type"] == "tool-input-available" && e["toolCallId"] == "c1"),
        "missing tool-input-available: {text}"
    );
    let finish = events.last().unwrap();
    assert_eq!(finish["finishReason"], "tool-calls");

    let (status, stored) = get_json(
        server.app.clone(),
        &format!("/v1/sessions/s1/messages/{suspended_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["parts"][0]["state"], "approval-requested");

    // Resume with the answer; no new user message is appended.
    let (status, text) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({
            "toolAnswers": { "c1": { "approved": true } },
            "parentMessageId": suspended_id,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = sse_events(&text);
    assert_eq!(events.last().unwrap()["finishReason"], "stop");

    let (status, stored) = get_json(
        server.app.clone(),
        &format!("/v1/sessions/s1/messages/{suspended_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["parts"][0]["state"], "output-available");
    assert_eq!(stored["parts"][0]["output"], json!({ "approved": true }));

    let (status, view) =
        get_json(server.app.clone(), "/v1/sessions/s1/view?include_messages=true").await;
    assert_eq!(status, StatusCode::OK);
    let messages = view["messages"].as_array().unwrap();
    let roles: Vec<&str> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "assistant"]);
    assert_eq!(messages[2]["parentMessageId"], suspended_id.as_str());
    assert_eq!(messages[2]["parts"][0]["text"], "done");
}

// ============================================================================
// POST /v1/sessions/:id/abort
// ============================================================================

#[tokio::test]
async fn test_abort_persists_partial_text() {
    let server = make_app_with(
        ScriptedExecutor::hanging(vec![vec![text_event("Hel")]]),
        ToolRegistry::new(),
    );

    let resp = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/sessions/s1/chat")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    json!({ "text": "stop me" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Read frames until the first delta is on the wire, so the partial
    // text is in the turn before the abort lands.
    let mut body = resp.into_body().into_data_stream();
    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !text.contains(r#""delta":"Hel""#) {
        let chunk = tokio::time::timeout_at(deadline, body.next())
            .await
            .expect("timed out waiting for the first delta")
            .expect("stream ended before the first delta");
        text.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
    }

    let (status, abort) = post_json(server.app.clone(), "/v1/sessions/s1/abort", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(abort["aborted"], json!(true));

    while let Some(chunk) = body.next().await {
        text.push_str(std::str::from_utf8(&chunk.unwrap()).unwrap());
    }
    assert!(
        text.contains("data: [DONE]"),
        "aborted stream should still end with [DONE]: {text}"
    );

    let events = sse_events(&text);
    let finish = events.last().unwrap();
    assert_eq!(finish["finishReason"], "stop");
    assert_eq!(finish["messageMetadata"]["aborted"], json!(true));
    assert_eq!(finish["messageMetadata"]["allowEmpty"], json!(true));

    let (status, view) =
        get_json(server.app.clone(), "/v1/sessions/s1/view?include_messages=true").await;
    assert_eq!(status, StatusCode::OK);
    let messages = view["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[1]["parts"][0],
        json!({ "type": "text", "text": "Hel" })
    );
    assert_eq!(messages[1]["metadata"]["aborted"], json!(true));

    // The turn is gone; a second abort finds nothing to cancel.
    let (status, abort) = post_json(server.app.clone(), "/v1/sessions/s1/abort", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(abort["aborted"], json!(false));
}

// ============================================================================
// Upstream model failure: error frame and session marker
// ============================================================================

#[tokio::test]
async fn test_upstream_error_marks_session_and_later_turn_clears_it() {
    let server = make_app(vec![
        vec![err_event("upstream offline")],
        vec![text_event("recovered"), end_event()],
    ]);

    let (status, text) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "hi" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let events = sse_events(&text);
    let failed_id = events[0]["messageId"].as_str().unwrap().to_string();
    assert!(
        events.iter().any(|e| e["type"] == "error"
            && e["errorText"].as_str().unwrap_or("").contains("upstream offline")),
        "missing error event: {text}"
    );
    assert_eq!(events.last().unwrap()["finishReason"], "error");

    // The failed turn still persists its assistant message, and the
    // session document records the failure.
    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 2);

    let (status, doc) = get_json(server.app.clone(), "/v1/sessions/s1/doc").await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        doc["lastError"]["message"]
            .as_str()
            .unwrap_or("")
            .contains("upstream offline"),
        "expected error marker: {doc}"
    );
    assert_eq!(doc["lastError"]["messageId"], failed_id.as_str());
    assert!(doc["lastError"]["at"].is_u64());

    let (status, stored) = get_json(
        server.app.clone(),
        &format!("/v1/sessions/s1/messages/{failed_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["parts"][0]["type"], "data-error");

    // A later successful turn clears the marker.
    let (status, text) = post_sse_text(
        server.app.clone(),
        "/v1/sessions/s1/chat",
        json!({ "text": "again" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sse_events(&text).last().unwrap()["finishReason"], "stop");

    let (status, doc) = get_json(server.app.clone(), "/v1/sessions/s1/doc").await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["lastError"].is_null(), "marker should be cleared: {doc}");
}

// ============================================================================
// GET /v1/sessions/:id/view
// ============================================================================

#[tokio::test]
async fn test_view_projection_params() {
    let server = make_app(vec![]);
    server
        .store
        .append_message("s1", seeded("m1", None, "root", 1))
        .await
        .unwrap();
    server
        .store
        .append_message("s1", seeded("m2", Some("m1"), "left", 2))
        .await
        .unwrap();
    server
        .store
        .append_message("s1", seeded("m3", Some("m1"), "right", 3))
        .await
        .unwrap();

    // Default: rightmost leaf, ids only.
    let (status, view) = get_json(server.app.clone(), "/v1/sessions/s1/view").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["leafMessageId"], "m3");
    assert_eq!(view["branchMessageIds"], json!(["m1", "m3"]));
    assert!(view["messages"].is_null());
    assert!(view["siblingNav"].is_null());

    // A self anchor freezes the view at that message.
    let (status, view) = get_json(
        server.app.clone(),
        "/v1/sessions/s1/view?anchor_message_id=m2&anchor_strategy=self&include_messages=true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["leafMessageId"], "m2");
    assert_eq!(view["branchMessageIds"], json!(["m1", "m2"]));
    assert_eq!(view["messages"].as_array().unwrap().len(), 2);

    // Without a strategy the anchor follows the newest leaf under it.
    let (status, view) = get_json(
        server.app.clone(),
        "/v1/sessions/s1/view?anchor_message_id=m1",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["leafMessageId"], "m3");

    let (status, view) = get_json(
        server.app.clone(),
        "/v1/sessions/s1/view?include_sibling_nav=true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["siblingNav"]["m3"]["siblingIndex"], 2);
    assert_eq!(view["siblingNav"]["m3"]["siblingTotal"], 2);
    assert_eq!(view["siblingNav"]["m3"]["prevSiblingId"], "m2");
    assert_eq!(view["siblingNav"]["m1"]["siblingTotal"], 1);
    // Nav covers chain members only.
    assert!(view["siblingNav"]["m2"].is_null());

    // A session with no messages projects an empty chain.
    let (status, view) = get_json(server.app.clone(), "/v1/sessions/fresh/view").await;
    assert_eq!(status, StatusCode::OK);
    assert!(view["leafMessageId"].is_null());
    assert_eq!(view["branchMessageIds"], json!([]));
}

// ============================================================================
// Session document
// ============================================================================

#[tokio::test]
async fn test_doc_patch_merges_and_null_removes() {
    let server = make_app(vec![]);

    let (status, doc) = get_json(server.app.clone(), "/v1/sessions/s1/doc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc, json!({}));

    let (status, doc) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/doc",
        json!({ "title": "Plans", "pinned": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc, json!({ "title": "Plans", "pinned": true }));

    let (status, doc) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/doc",
        json!({ "pinned": null }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc, json!({ "title": "Plans" }));

    let (status, doc) = get_json(server.app.clone(), "/v1/sessions/s1/doc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc, json!({ "title": "Plans" }));

    let (status, body) = patch_json(server.app.clone(), "/v1/sessions/s1/doc", json!([1, 2])).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"].as_str().unwrap_or("").contains("JSON object"),
        "expected object validation error: {body}"
    );
}

// ============================================================================
// GET /v1/sessions/:id/stats
// ============================================================================

#[tokio::test]
async fn test_stats_counts_messages() {
    let server = make_app(vec![]);

    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 0);

    server
        .store
        .append_message("s1", seeded("m1", None, "one", 1))
        .await
        .unwrap();
    server
        .store
        .append_message("s1", seeded("m2", Some("m1"), "two", 2))
        .await
        .unwrap();
    server
        .store
        .append_message("s1", seeded("m3", Some("m2"), "three", 3))
        .await
        .unwrap();

    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 3);
}

// ============================================================================
// Message CRUD
// ============================================================================

#[tokio::test]
async fn test_message_crud_and_subtree_delete() {
    let server = make_app(vec![]);
    server
        .store
        .append_message("s1", seeded("m1", None, "question", 1))
        .await
        .unwrap();
    let mut answer = Message::assistant();
    answer.id = "m2".to_string();
    answer.parent_message_id = Some("m1".to_string());
    server.store.append_message("s1", answer).await.unwrap();
    server
        .store
        .append_message("s1", seeded("m3", Some("m2"), "follow-up", 3))
        .await
        .unwrap();

    let (status, message) = get_json(server.app.clone(), "/v1/sessions/s1/messages/m2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["id"], "m2");
    assert_eq!(message["role"], "assistant");
    assert_eq!(message["parentMessageId"], "m1");

    let (status, body) = get_json(server.app.clone(), "/v1/sessions/s1/messages/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(
        body["error"].as_str().unwrap_or("").contains("not found"),
        "expected not found error: {body}"
    );

    let (status, merged) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/messages/m1/metadata",
        json!({ "pinned": true }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(merged, json!({ "pinned": true }));

    let (status, merged) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/messages/m1/metadata",
        json!({ "pinned": null, "note": "kept" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(merged, json!({ "note": "kept" }));

    let (status, message) = get_json(server.app.clone(), "/v1/sessions/s1/messages/m1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(message["metadata"], json!({ "note": "kept" }));

    let (status, _) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/messages/ghost/metadata",
        json!({ "pinned": true }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/messages/m1/metadata",
        json!("not an object"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"].as_str().unwrap_or("").contains("JSON object"),
        "expected object validation error: {body}"
    );

    // Deleting m2 takes its descendant m3 with it.
    let (status, outcome) = delete_json(server.app.clone(), "/v1/sessions/s1/messages/m2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        outcome,
        json!({ "deletedCount": 2, "parentMessageId": "m1" })
    );

    let (status, _) = get_json(server.app.clone(), "/v1/sessions/s1/messages/m3").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 1);

    let (status, _) = delete_json(server.app.clone(), "/v1/sessions/s1/messages/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Session id validation
// ============================================================================

#[tokio::test]
async fn test_invalid_session_id_is_rejected() {
    let server = make_app(vec![]);

    let (status, body) = get_json(server.app.clone(), "/v1/sessions/sess..id/stats").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]
            .as_str()
            .unwrap_or("")
            .contains("invalid session id"),
        "expected session id validation error: {body}"
    );
}

// ============================================================================
// DELETE /v1/sessions/:id
// ============================================================================

#[tokio::test]
async fn test_delete_session_is_idempotent() {
    let server = make_app(vec![]);
    server
        .store
        .append_message("s1", seeded("m1", None, "bye", 1))
        .await
        .unwrap();
    let (status, _) = patch_json(
        server.app.clone(),
        "/v1/sessions/s1/doc",
        json!({ "title": "gone soon" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = delete_json(server.app.clone(), "/v1/sessions/s1").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, stats) = get_json(server.app.clone(), "/v1/sessions/s1/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["messageCount"], 0);
    let (status, doc) = get_json(server.app.clone(), "/v1/sessions/s1/doc").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc, json!({}));

    let (status, _) = delete_json(server.app.clone(), "/v1/sessions/s1").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}
