//! Accumulation of one model round from a genai event stream.

use genai::chat::{ChatStreamEvent, Usage};
use serde_json::Value;
use std::collections::HashMap;

/// Partial tool call being assembled while chunks stream in.
#[derive(Debug, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// A complete tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Everything one model round produced.
#[derive(Debug, Default)]
pub struct RoundResult {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: Option<Usage>,
}

impl RoundResult {
    pub fn needs_tools(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Notable outputs surfaced while processing a round.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutput {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { id: String, name: String },
}

/// Collects a genai event stream into text, reasoning and tool calls.
///
/// Tool argument chunks need care: with capture enabled each chunk carries
/// the ACCUMULATED argument string rather than a delta, so the stored value
/// is replaced, not appended. The End event is the source of truth and
/// overrides whatever the chunks produced.
#[derive(Debug, Default)]
pub struct RoundCollector {
    text: String,
    reasoning: String,
    tool_calls: HashMap<String, PartialToolCall>,
    tool_call_order: Vec<String>,
    usage: Option<Usage>,
}

impl RoundCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one stream event, returning an output when something the
    /// caller should surface happened.
    pub fn process(&mut self, event: ChatStreamEvent) -> Option<RoundOutput> {
        match event {
            ChatStreamEvent::Chunk(chunk) => {
                if !chunk.content.is_empty() {
                    self.text.push_str(&chunk.content);
                    return Some(RoundOutput::TextDelta(chunk.content));
                }
                None
            }
            ChatStreamEvent::ReasoningChunk(chunk) => {
                if !chunk.content.is_empty() {
                    self.reasoning.push_str(&chunk.content);
                    return Some(RoundOutput::ReasoningDelta(chunk.content));
                }
                None
            }
            ChatStreamEvent::ToolCallChunk(tool_chunk) => {
                let call_id = tool_chunk.tool_call.call_id.clone();

                // Get or create the partial while preserving first-seen order.
                let partial = match self.tool_calls.entry(call_id.clone()) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => {
                        self.tool_call_order.push(call_id.clone());
                        e.insert(PartialToolCall {
                            id: call_id.clone(),
                            name: String::new(),
                            arguments: String::new(),
                        })
                    }
                };

                let mut output = None;
                if !tool_chunk.tool_call.fn_name.is_empty() && partial.name.is_empty() {
                    partial.name = tool_chunk.tool_call.fn_name.clone();
                    output = Some(RoundOutput::ToolCallStart {
                        id: call_id,
                        name: partial.name.clone(),
                    });
                }

                let args_str = raw_args(&tool_chunk.tool_call.fn_arguments);
                if !args_str.is_empty() {
                    partial.arguments = args_str;
                }

                output
            }
            ChatStreamEvent::End(end) => {
                // Captured calls from the End event override streamed
                // partials, which may be wrong for providers that chunk
                // oddly.
                if let Some(tool_calls) = end.captured_tool_calls() {
                    for tc in tool_calls {
                        let end_args = raw_args(&tc.fn_arguments);
                        match self.tool_calls.entry(tc.call_id.clone()) {
                            std::collections::hash_map::Entry::Occupied(mut e) => {
                                let partial = e.get_mut();
                                if partial.name.is_empty() {
                                    partial.name = tc.fn_name.clone();
                                }
                                if !end_args.is_empty() {
                                    partial.arguments = end_args;
                                }
                            }
                            std::collections::hash_map::Entry::Vacant(e) => {
                                self.tool_call_order.push(tc.call_id.clone());
                                e.insert(PartialToolCall {
                                    id: tc.call_id.clone(),
                                    name: tc.fn_name.clone(),
                                    arguments: end_args,
                                });
                            }
                        }
                    }
                }
                self.usage = end.captured_usage;
                None
            }
            _ => None,
        }
    }

    /// Finish the round. Calls that never received a name are dropped;
    /// unparseable argument strings fall back to null.
    pub fn finish(self) -> RoundResult {
        let mut remaining = self.tool_calls;
        let mut tool_calls: Vec<ToolInvocation> = Vec::with_capacity(self.tool_call_order.len());

        for call_id in self.tool_call_order {
            let Some(p) = remaining.remove(&call_id) else {
                continue;
            };
            if p.name.is_empty() {
                continue;
            }
            let arguments = serde_json::from_str(&p.arguments).unwrap_or(Value::Null);
            tool_calls.push(ToolInvocation {
                id: p.id,
                name: p.name,
                arguments,
            });
        }

        RoundResult {
            text: self.text,
            reasoning: self.reasoning,
            tool_calls,
            usage: self.usage,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Extract the raw argument string from a chunk payload. genai wraps
/// streamed strings in `Value::String`; `.to_string()` on that would
/// JSON-escape it with extra quotes.
fn raw_args(fn_arguments: &Value) -> String {
    match fn_arguments {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Null | Value::String(_) => String::new(),
        other => other.to_string(),
    }
}
