use std::collections::HashMap;

use arbor_chat_model::{Message, MessagePart, ToolCallState};
use serde_json::Value;

/// Result of folding user approval answers into a message chain.
pub struct ApprovalOutcome {
    /// Chain ready to send to the model. Answered approval calls are
    /// rewritten to resolved tool calls; unanswered ones are stripped, and
    /// messages stripped to nothing are dropped.
    pub chain: Vec<Message>,
    /// Messages whose stored parts must be updated because an approval was
    /// answered. Unanswered calls stay pending in these, only the answered
    /// ones are rewritten.
    pub persisted_updates: Vec<Message>,
}

/// Folds approval answers into `chain` before a model call.
///
/// A model provider rejects a conversation that contains a tool call with
/// no result, so every approval-requested call must either become a
/// resolved call (answer present, payload becomes the output) or disappear
/// from the outgoing chain (no answer yet). The stored history keeps
/// unanswered calls pending so the client can still render the approval
/// prompt after a reload.
pub fn apply_tool_answers(
    chain: Vec<Message>,
    answers: &HashMap<String, Value>,
) -> ApprovalOutcome {
    let mut outgoing = Vec::with_capacity(chain.len());
    let mut persisted_updates = Vec::new();

    for message in chain {
        let mut outgoing_parts = Vec::with_capacity(message.parts.len());
        let mut persisted_parts = Vec::with_capacity(message.parts.len());
        let mut answered_any = false;

        for part in &message.parts {
            match part {
                MessagePart::ToolCall {
                    tool_call_id,
                    state: ToolCallState::ApprovalRequested,
                    ..
                } => {
                    if let Some(payload) = answers.get(tool_call_id) {
                        let resolved = resolve_call(part, payload.clone());
                        outgoing_parts.push(resolved.clone());
                        persisted_parts.push(resolved);
                        answered_any = true;
                    } else {
                        persisted_parts.push(part.clone());
                    }
                }
                _ => {
                    outgoing_parts.push(part.clone());
                    persisted_parts.push(part.clone());
                }
            }
        }

        if answered_any {
            let mut updated = message.clone();
            updated.parts = persisted_parts;
            persisted_updates.push(updated);
        }

        let stripped_to_empty = outgoing_parts.is_empty() && !message.parts.is_empty();
        if !stripped_to_empty {
            let mut outbound = message;
            outbound.parts = outgoing_parts;
            outgoing.push(outbound);
        }
    }

    ApprovalOutcome {
        chain: outgoing,
        persisted_updates,
    }
}

fn resolve_call(part: &MessagePart, payload: Value) -> MessagePart {
    match part {
        MessagePart::ToolCall {
            tool_call_id,
            tool_name,
            input,
            error_text,
            ..
        } => MessagePart::ToolCall {
            tool_call_id: tool_call_id.clone(),
            tool_name: tool_name.clone(),
            state: ToolCallState::OutputAvailable,
            input: input.clone(),
            output: Some(payload),
            error_text: error_text.clone(),
        },
        other => other.clone(),
    }
}
