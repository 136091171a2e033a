//! Wire-level stream record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal `finishReason` values.
pub mod finish_reason {
    pub const STOP: &str = "stop";
    pub const LENGTH: &str = "length";
    pub const TOOL_CALLS: &str = "tool-calls";
    pub const ERROR: &str = "error";
    pub const OTHER: &str = "other";
}

/// One typed record of the UI message stream.
///
/// Serialized with a `type` tag in kebab-case. Consumers must ignore
/// unknown fields; records with an unrecognized `type` fall through to
/// [`Data`](Self::Data) when they carry a `data` field, and are otherwise
/// handled by the parser as opaque passthrough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiStreamEvent {
    /// Opens the turn and names the assistant message being produced.
    Start {
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
    },
    /// Step-boundary indicator; protocol-only, never part of stored content.
    StartStep,
    FinishStep,
    Finish {
        #[serde(rename = "finishReason", skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(rename = "messageMetadata", skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
    /// Custom `data-<name>` record. `transient` marks live-only content
    /// that must not land in persisted history.
    #[serde(untagged)]
    Data {
        #[serde(rename = "type")]
        data_type: String,
        data: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        transient: bool,
    },
}

impl UiStreamEvent {
    pub fn start(message_id: impl Into<String>) -> Self {
        Self::Start {
            message_id: Some(message_id.into()),
        }
    }

    pub fn text_start(id: impl Into<String>) -> Self {
        Self::TextStart { id: id.into() }
    }

    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn text_end(id: impl Into<String>) -> Self {
        Self::TextEnd { id: id.into() }
    }

    pub fn reasoning_start(id: impl Into<String>) -> Self {
        Self::ReasoningStart { id: id.into() }
    }

    pub fn reasoning_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn reasoning_end(id: impl Into<String>) -> Self {
        Self::ReasoningEnd { id: id.into() }
    }

    pub fn tool_input_start(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self::ToolInputStart {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    pub fn tool_input_available(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self::ToolInputAvailable {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
        }
    }

    pub fn tool_output_available(tool_call_id: impl Into<String>, output: Value) -> Self {
        Self::ToolOutputAvailable {
            tool_call_id: tool_call_id.into(),
            output,
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self::Finish {
            finish_reason: Some(reason.into()),
            message_metadata: None,
        }
    }

    pub fn finish_with_metadata(reason: impl Into<String>, metadata: Value) -> Self {
        Self::Finish {
            finish_reason: Some(reason.into()),
            message_metadata: Some(metadata),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error {
            error_text: text.into(),
        }
    }

    /// Custom record; `name` is prefixed to the wire type `data-<name>`.
    pub fn data(name: &str, data: Value) -> Self {
        Self::Data {
            data_type: format!("data-{name}"),
            data,
            transient: false,
        }
    }
}
