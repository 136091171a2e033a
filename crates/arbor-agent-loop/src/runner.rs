//! One agent turn from request to persisted assistant message.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use arbor_chat_model::{
    gen_message_id, now_millis, Message, MessagePart, MetadataMap, ToolCallState,
};
use arbor_chat_store::ChatStore;
use arbor_chat_view::resolve_rightmost_leaf;
use arbor_protocol_ui_stream::{finish_reason, StreamFrame, UiStreamEvent};
use async_stream::stream;
use futures::{Stream, StreamExt};
use genai::chat::{ChatOptions, ChatStreamEvent};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::approval::apply_tool_answers;
use crate::collector::{RoundCollector, RoundOutput};
use crate::convert::build_chat_request;
use crate::error::TurnError;
use crate::executor::{ModelResolver, ResolvedModel};
use crate::subagent::WaitReport;
use crate::tools::{ToolContext, ToolError, ToolRegistry, PLAN_UPDATE_TOOL};

const DEFAULT_MAX_ROUNDS: usize = 10;

/// Identity of the agent serving this deployment, stamped into assistant
/// message metadata alongside the model that produced the message.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
    pub kind: String,
}

impl AgentIdentity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Parameters for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    /// Message the assistant reply attaches to. `None` resolves the
    /// rightmost leaf at turn start. The parent never moves after that,
    /// regardless of concurrent appends.
    pub parent_message_id: Option<String>,
    /// Per-request model override.
    pub model: Option<String>,
    /// Approval answers keyed by tool call id, folded into the replayed
    /// chain before the first model call.
    pub tool_answers: HashMap<String, Value>,
    /// Tail limit on the replayed chain.
    pub max_messages: Option<usize>,
}

/// Frames produced by a running turn, in wire order.
pub type TurnStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// Drives agent turns against a session store.
pub struct TurnRunner {
    store: Arc<ChatStore>,
    resolver: Arc<dyn ModelResolver>,
    tools: Arc<ToolRegistry>,
    agent: AgentIdentity,
    max_rounds: usize,
}

struct Prepared {
    parent_id: Option<String>,
    chain: Vec<Message>,
    resolved: ResolvedModel,
}

enum StreamStep {
    Cancelled,
    Event(Option<Result<ChatStreamEvent, TurnError>>),
}

impl TurnRunner {
    pub fn new(
        store: Arc<ChatStore>,
        resolver: Arc<dyn ModelResolver>,
        tools: Arc<ToolRegistry>,
        agent: AgentIdentity,
    ) -> Self {
        Self {
            store,
            resolver,
            tools,
            agent,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Validates the request, folds approval answers into the stored
    /// history, and resolves the model. Nothing is streamed yet; failures
    /// here surface as an error frame followed by a finish frame. A token
    /// already cancelled at this point fails with [`TurnError::Aborted`]
    /// and leaves history untouched.
    async fn prepare(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> Result<Prepared, TurnError> {
        if cancel.is_cancelled() {
            return Err(TurnError::Aborted);
        }
        if request.session_id.trim().is_empty() {
            return Err(TurnError::Validation(
                "session id must not be empty".to_string(),
            ));
        }

        let parent_id = match &request.parent_message_id {
            Some(id) => match self
                .store
                .get_message_by_id(&request.session_id, id)
                .await?
            {
                Some(_) => Some(id.clone()),
                None => return Err(TurnError::NotFound(format!("message '{id}'"))),
            },
            None => {
                let tree = self.store.load_message_tree(&request.session_id).await?;
                resolve_rightmost_leaf(&tree)
            }
        };

        let chain = match &parent_id {
            Some(leaf) => {
                self.store
                    .load_message_chain(&request.session_id, leaf, request.max_messages)
                    .await?
            }
            None => Vec::new(),
        };

        let outcome = apply_tool_answers(chain, &request.tool_answers);
        for updated in &outcome.persisted_updates {
            self.store
                .update_message_parts(&request.session_id, &updated.id, updated.parts.clone())
                .await?;
        }

        let resolved = self.resolver.resolve(request.model.as_deref()).await?;

        Ok(Prepared {
            parent_id,
            chain: outcome.chain,
            resolved,
        })
    }

    /// Runs one turn. The returned stream yields every wire frame in order
    /// and ends with a finish frame no matter how the turn went; the
    /// assistant message is persisted before that final frame.
    pub fn run_turn(self: &Arc<Self>, request: TurnRequest, cancel: CancellationToken) -> TurnStream {
        let runner = Arc::clone(self);
        Box::pin(stream! {
            let started = Instant::now();
            let session_id = request.session_id.clone();

            let prepared = match runner.prepare(&request, &cancel).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "turn setup failed");
                    yield StreamFrame::Persisted(UiStreamEvent::error(e.to_string()));
                    yield StreamFrame::Persisted(UiStreamEvent::finish(finish_reason::ERROR));
                    return;
                }
            };

            let Prepared { parent_id, chain, resolved } = prepared;
            let model = resolved.model.clone();
            let assistant_id = gen_message_id();
            info!(
                session_id = %session_id,
                model = %model,
                executor = resolved.executor.name(),
                parent = parent_id.as_deref().unwrap_or("<root>"),
                "turn start"
            );

            yield StreamFrame::Persisted(UiStreamEvent::start(assistant_id.clone()));

            let descriptors = runner.tools.descriptors();
            let options = ChatOptions::default()
                .with_capture_usage(true)
                .with_capture_reasoning_content(true)
                .with_capture_tool_calls(true);

            // Model-bound parts include transient tool results, persisted
            // parts do not.
            let mut replay_parts: Vec<MessagePart> = Vec::new();
            let mut persist_parts: Vec<MessagePart> = Vec::new();
            let mut plan_update: Option<Value> = None;
            let mut usage_input: i64 = 0;
            let mut usage_output: i64 = 0;
            let mut usage_total: i64 = 0;
            let mut saw_usage = false;
            let mut aborted = false;
            let mut turn_error: Option<TurnError> = None;
            let mut finish = finish_reason::STOP;

            let mut round = 0;
            loop {
                if round >= runner.max_rounds {
                    debug!(session_id = %session_id, rounds = round, "round limit reached");
                    finish = finish_reason::OTHER;
                    break;
                }

                let mut round_chain = chain.clone();
                if !replay_parts.is_empty() {
                    round_chain.push(Message::assistant().with_parts(replay_parts.clone()));
                }
                let chat_req = build_chat_request(&round_chain, &descriptors);

                yield StreamFrame::Persisted(UiStreamEvent::StartStep);

                let mut events = match resolved
                    .executor
                    .exec_chat_stream_events(&model, chat_req, Some(&options))
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        turn_error = Some(e);
                        break;
                    }
                };

                let text_id = format!("txt_{round}");
                let reasoning_id = format!("rsn_{round}");
                let mut text_open = false;
                let mut reasoning_open = false;
                let mut collector = RoundCollector::new();

                loop {
                    let step = tokio::select! {
                        _ = cancel.cancelled() => StreamStep::Cancelled,
                        event = events.next() => StreamStep::Event(event),
                    };
                    match step {
                        StreamStep::Cancelled => {
                            aborted = true;
                            break;
                        }
                        StreamStep::Event(Some(Ok(event))) => {
                            match collector.process(event) {
                                Some(RoundOutput::TextDelta(delta)) => {
                                    if reasoning_open {
                                        reasoning_open = false;
                                        yield StreamFrame::Persisted(UiStreamEvent::reasoning_end(reasoning_id.clone()));
                                    }
                                    if !text_open {
                                        text_open = true;
                                        yield StreamFrame::Persisted(UiStreamEvent::text_start(text_id.clone()));
                                    }
                                    yield StreamFrame::Persisted(UiStreamEvent::text_delta(text_id.clone(), delta));
                                }
                                Some(RoundOutput::ReasoningDelta(delta)) => {
                                    if !reasoning_open {
                                        reasoning_open = true;
                                        yield StreamFrame::Persisted(UiStreamEvent::reasoning_start(reasoning_id.clone()));
                                    }
                                    yield StreamFrame::Persisted(UiStreamEvent::reasoning_delta(reasoning_id.clone(), delta));
                                }
                                Some(RoundOutput::ToolCallStart { id, name }) => {
                                    yield StreamFrame::Persisted(UiStreamEvent::tool_input_start(id, name));
                                }
                                None => {}
                            }
                        }
                        StreamStep::Event(Some(Err(e))) => {
                            turn_error = Some(e);
                            break;
                        }
                        StreamStep::Event(None) => break,
                    }
                }

                if reasoning_open {
                    yield StreamFrame::Persisted(UiStreamEvent::reasoning_end(reasoning_id.clone()));
                }
                if text_open {
                    yield StreamFrame::Persisted(UiStreamEvent::text_end(text_id.clone()));
                }

                let result = collector.finish();
                if let Some(usage) = &result.usage {
                    saw_usage = true;
                    usage_input += i64::from(usage.prompt_tokens.unwrap_or(0));
                    usage_output += i64::from(usage.completion_tokens.unwrap_or(0));
                    usage_total += i64::from(usage.total_tokens.unwrap_or(0));
                }
                if !result.reasoning.is_empty() {
                    let part = MessagePart::reasoning(result.reasoning.clone());
                    replay_parts.push(part.clone());
                    persist_parts.push(part);
                }
                if !result.text.is_empty() {
                    let part = MessagePart::text(result.text.clone());
                    replay_parts.push(part.clone());
                    persist_parts.push(part);
                }

                if aborted || turn_error.is_some() {
                    break;
                }

                if result.tool_calls.is_empty() {
                    yield StreamFrame::Persisted(UiStreamEvent::FinishStep);
                    break;
                }

                let mut suspended = false;
                for call in result.tool_calls {
                    yield StreamFrame::Persisted(UiStreamEvent::tool_input_available(
                        call.id.clone(),
                        call.name.clone(),
                        call.arguments.clone(),
                    ));

                    let Some(tool) = runner.tools.get(&call.name) else {
                        let message = ToolError::NotFound(call.name.clone()).to_string();
                        debug!(session_id = %session_id, tool = %call.name, "model requested unknown tool");
                        let part = MessagePart::ToolCall {
                            tool_call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            state: ToolCallState::OutputError,
                            input: Some(call.arguments.clone()),
                            output: None,
                            error_text: Some(message.clone()),
                        };
                        replay_parts.push(part.clone());
                        persist_parts.push(part);
                        yield StreamFrame::Persisted(UiStreamEvent::tool_output_available(
                            call.id.clone(),
                            json!({ "error": message }),
                        ));
                        continue;
                    };

                    if tool.requires_approval(&call.arguments) {
                        debug!(session_id = %session_id, tool = %call.name, id = %call.id, "tool call suspended for approval");
                        let part = MessagePart::tool_call(
                            call.id.clone(),
                            call.name.clone(),
                            ToolCallState::ApprovalRequested,
                            Some(call.arguments.clone()),
                        );
                        replay_parts.push(part.clone());
                        persist_parts.push(part);
                        suspended = true;
                        continue;
                    }

                    let ctx = ToolContext {
                        session_id: session_id.clone(),
                        tool_call_id: call.id.clone(),
                        cancel: cancel.clone(),
                    };
                    match tool.execute(call.arguments.clone(), &ctx).await {
                        Ok(output) => {
                            if call.name == PLAN_UPDATE_TOOL {
                                plan_update = Some(call.arguments.clone());
                            }
                            let transient = wait_report_is_transient(&output);
                            let part = MessagePart::ToolCall {
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                state: ToolCallState::OutputAvailable,
                                input: Some(call.arguments.clone()),
                                output: Some(output.clone()),
                                error_text: None,
                            };
                            replay_parts.push(part.clone());
                            if transient {
                                yield StreamFrame::Transient(UiStreamEvent::tool_output_available(
                                    call.id.clone(),
                                    output,
                                ));
                            } else {
                                persist_parts.push(part);
                                yield StreamFrame::Persisted(UiStreamEvent::tool_output_available(
                                    call.id.clone(),
                                    output,
                                ));
                            }
                        }
                        Err(tool_err) => {
                            let message = tool_err.to_string();
                            debug!(session_id = %session_id, tool = %call.name, error = %message, "tool execution failed");
                            let part = MessagePart::ToolCall {
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                state: ToolCallState::OutputError,
                                input: Some(call.arguments.clone()),
                                output: None,
                                error_text: Some(message.clone()),
                            };
                            replay_parts.push(part.clone());
                            persist_parts.push(part);
                            yield StreamFrame::Persisted(UiStreamEvent::tool_output_available(
                                call.id.clone(),
                                json!({ "error": message }),
                            ));
                        }
                    }
                }

                yield StreamFrame::Persisted(UiStreamEvent::FinishStep);

                if suspended {
                    finish = finish_reason::TOOL_CALLS;
                    break;
                }
                round += 1;
            }

            let duration_ms = started.elapsed().as_millis() as u64;

            let mut metadata = MetadataMap::new();
            if saw_usage {
                metadata.insert(
                    "usage".to_string(),
                    json!({
                        "inputTokens": usage_input,
                        "outputTokens": usage_output,
                        "totalTokens": usage_total,
                    }),
                );
            }
            metadata.insert("durationMs".to_string(), json!(duration_ms));
            metadata.insert(
                "agent".to_string(),
                json!({
                    "id": runner.agent.id,
                    "name": runner.agent.name,
                    "kind": runner.agent.kind,
                    "model": model,
                }),
            );
            if let Some(plan) = plan_update {
                metadata.insert("planUpdate".to_string(), plan);
            }
            if aborted {
                metadata.insert("aborted".to_string(), json!(true));
                metadata.insert("allowEmpty".to_string(), json!(true));
            }

            if let Some(e) = &turn_error {
                error!(session_id = %session_id, error = %e, "turn failed");
                yield StreamFrame::Persisted(UiStreamEvent::error(e.to_string()));
                persist_parts.push(MessagePart::data(
                    "error",
                    json!({ "message": e.to_string() }),
                ));
                finish = finish_reason::ERROR;

                let mut patch = MetadataMap::new();
                patch.insert(
                    "lastError".to_string(),
                    json!({
                        "message": e.to_string(),
                        "messageId": assistant_id,
                        "at": now_millis(),
                    }),
                );
                if let Err(store_err) = runner.store.write_session_json(&session_id, patch).await {
                    error!(session_id = %session_id, error = %store_err, "failed to record session error marker");
                }
            } else if !aborted {
                runner.clear_error_marker(&session_id).await;
            }

            let metadata_value = Value::Object(metadata.clone());

            let mut assistant = Message::assistant();
            assistant.id = assistant_id.clone();
            assistant.parent_message_id = parent_id;
            assistant.parts = persist_parts;
            assistant.metadata = metadata;

            if let Err(e) = runner.store.append_message(&session_id, assistant).await {
                error!(session_id = %session_id, error = %e, "failed to persist assistant message");
                yield StreamFrame::Persisted(UiStreamEvent::error(format!(
                    "failed to persist assistant message: {e}"
                )));
            }

            info!(
                session_id = %session_id,
                message_id = %assistant_id,
                finish_reason = finish,
                duration_ms,
                "turn complete"
            );
            yield StreamFrame::Persisted(UiStreamEvent::finish_with_metadata(finish, metadata_value));
        })
    }

    /// Drops the session-level error marker left by an earlier failed turn.
    async fn clear_error_marker(&self, session_id: &str) {
        let had_error = match self.store.read_session_json(session_id).await {
            Ok(Some(doc)) => doc.get("lastError").map_or(false, |v| !v.is_null()),
            Ok(None) => false,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "could not read session document");
                false
            }
        };
        if !had_error {
            return;
        }
        let mut patch = MetadataMap::new();
        patch.insert("lastError".to_string(), Value::Null);
        if let Err(e) = self.store.write_session_json(session_id, patch).await {
            error!(session_id = %session_id, error = %e, "failed to clear session error marker");
        }
    }
}

/// A tool output shaped like a wait report is transient while the polled
/// work is still in flight.
fn wait_report_is_transient(output: &Value) -> bool {
    serde_json::from_value::<WaitReport>(output.clone())
        .map_or(false, |report| report.is_transient())
}
