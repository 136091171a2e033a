//! Typed message content blocks.
//!
//! Parts are a closed sum type tagged by `type`; every consumer matches
//! exhaustively so an unhandled kind is a compile error, not a silent no-op.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a tool-call part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    /// Arguments are still streaming from the model.
    InputStreaming,
    /// Arguments are complete, ready for execution.
    InputAvailable,
    /// Paused awaiting human approval before execution.
    ApprovalRequested,
    /// Execution completed with output.
    OutputAvailable,
    /// Execution failed.
    OutputError,
}

/// One content block of a [`crate::Message`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    /// Plain text content.
    Text {
        /// The text content.
        text: String,
    },

    /// Model reasoning content.
    Reasoning {
        /// The reasoning text.
        text: String,
    },

    /// A tool invocation, from streamed input through resolution.
    ToolCall {
        /// Tool call identifier.
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        /// Tool name.
        #[serde(rename = "toolName")]
        tool_name: String,
        /// Lifecycle state.
        state: ToolCallState,
        /// Tool input (complete once state reaches input-available).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        /// Tool output (present in output-available state).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        /// Error text (present in output-error state).
        #[serde(rename = "errorText", default, skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
    },

    /// A standalone tool result, used when the producing call lives in a
    /// different message (sub-agent reports).
    ToolResult {
        /// Identifier of the originating tool call.
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        /// Result payload.
        output: Value,
    },

    /// Opaque file attachment reference.
    File {
        /// File URL.
        url: String,
        /// IANA media type.
        #[serde(rename = "mediaType")]
        media_type: String,
    },

    /// Custom data part with a `data-*` type name.
    #[serde(untagged)]
    Data {
        /// Custom type (always `data-` prefixed).
        #[serde(rename = "type")]
        data_type: String,
        /// Data payload.
        data: Value,
    },
}

impl MessagePart {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a reasoning part.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// Create a tool-call part in the given state.
    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        state: ToolCallState,
        input: Option<Value>,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            state,
            input,
            output: None,
            error_text: None,
        }
    }

    /// Create a custom data part; `name` is prefixed with `data-`.
    pub fn data(name: impl Into<String>, data: Value) -> Self {
        Self::Data {
            data_type: format!("data-{}", name.into()),
            data,
        }
    }
}
