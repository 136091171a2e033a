//! Conversion from stored chat messages to the genai request types.

use arbor_chat_model::{Message, MessagePart, Role, ToolCallState};
use genai::chat::{ChatMessage, ChatRequest, MessageContent, ToolResponse};
use serde_json::Value;

use crate::tools::ToolDescriptor;

/// Convert a tool descriptor to the genai tool declaration.
pub fn to_genai_tool(descriptor: &ToolDescriptor) -> genai::chat::Tool {
    genai::chat::Tool::new(&descriptor.id)
        .with_description(&descriptor.description)
        .with_schema(descriptor.parameters.clone())
}

/// Flatten a stored branch into provider messages.
///
/// Resolved tool calls expand into two wire messages: the assistant turn
/// carrying the call and a tool turn carrying its result, which is the
/// sequencing every provider requires. Reasoning parts and bookkeeping rows
/// are not replayed. Pending approval calls must be folded away by
/// [`crate::apply_tool_answers`] before this runs; anything still
/// unresolved here is skipped rather than sent as a call without a result.
pub fn chain_to_chat_messages(chain: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(chain.len());
    for message in chain {
        match message.role {
            Role::System => {
                let text = message.text_content();
                if !text.is_empty() {
                    out.push(ChatMessage::system(text));
                }
            }
            Role::User => {
                let text = message.text_content();
                if !text.is_empty() {
                    out.push(ChatMessage::user(text));
                }
            }
            Role::Subagent => {}
            Role::Assistant => push_assistant_messages(message, &mut out),
        }
    }
    out
}

fn push_assistant_messages(message: &Message, out: &mut Vec<ChatMessage>) {
    let text = message.text_content();
    let mut calls: Vec<genai::chat::ToolCall> = Vec::new();
    let mut responses: Vec<ToolResponse> = Vec::new();

    for part in &message.parts {
        match part {
            MessagePart::ToolCall {
                tool_call_id,
                tool_name,
                state: ToolCallState::OutputAvailable,
                input,
                output,
                ..
            } => {
                calls.push(genai_call(tool_call_id, tool_name, input));
                responses.push(ToolResponse {
                    call_id: tool_call_id.clone(),
                    content: output.clone().unwrap_or(Value::Null).to_string(),
                });
            }
            MessagePart::ToolCall {
                tool_call_id,
                tool_name,
                state: ToolCallState::OutputError,
                input,
                error_text,
                ..
            } => {
                calls.push(genai_call(tool_call_id, tool_name, input));
                let error = error_text.as_deref().unwrap_or("tool failed");
                responses.push(ToolResponse {
                    call_id: tool_call_id.clone(),
                    content: serde_json::json!({ "error": error }).to_string(),
                });
            }
            MessagePart::ToolResult {
                tool_call_id,
                output,
            } => {
                responses.push(ToolResponse {
                    call_id: tool_call_id.clone(),
                    content: output.to_string(),
                });
            }
            // Text folds in through text_content above; the rest never
            // replays to the provider.
            MessagePart::Text { .. }
            | MessagePart::Reasoning { .. }
            | MessagePart::File { .. }
            | MessagePart::Data { .. }
            | MessagePart::ToolCall {
                state:
                    ToolCallState::InputStreaming
                    | ToolCallState::InputAvailable
                    | ToolCallState::ApprovalRequested,
                ..
            } => {}
        }
    }

    if calls.is_empty() {
        if !text.is_empty() {
            out.push(ChatMessage::assistant(text));
        }
    } else {
        let mut content = MessageContent::from(text.as_str());
        for call in calls {
            content.push(genai::chat::ContentPart::ToolCall(call));
        }
        out.push(ChatMessage::assistant(content));
    }
    for response in responses {
        out.push(ChatMessage::from(response));
    }
}

fn genai_call(
    tool_call_id: &str,
    tool_name: &str,
    input: &Option<Value>,
) -> genai::chat::ToolCall {
    genai::chat::ToolCall {
        call_id: tool_call_id.to_string(),
        fn_name: tool_name.to_string(),
        fn_arguments: input.clone().unwrap_or(Value::Null),
        thought_signatures: None,
    }
}

/// Build the genai request for one model round.
pub fn build_chat_request(chain: &[Message], descriptors: &[ToolDescriptor]) -> ChatRequest {
    let messages = chain_to_chat_messages(chain);
    let mut request = ChatRequest::new(messages);
    if !descriptors.is_empty() {
        let tools: Vec<genai::chat::Tool> = descriptors.iter().map(to_genai_tool).collect();
        request = request.with_tools(tools);
    }
    request
}
