//! Message type and identity helpers.

use crate::part::MessagePart;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque structured metadata attached to a message.
pub type MetadataMap = serde_json::Map<String, Value>;

/// Generate a unique message id (UUID v7, time-ordered).
pub fn gen_message_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Current unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt / instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Internal sub-agent turn; hidden from the visible timeline.
    Subagent,
}

/// Bookkeeping classification of a message.
///
/// `CompactPrompt` nodes carry the internal prompt used to compact a long
/// history; they stay addressable for branching but are not displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Normal,
    CompactPrompt,
    CompactSummary,
}

impl MessageKind {
    fn is_normal(&self) -> bool {
        matches!(self, MessageKind::Normal)
    }
}

/// One node of a session's message tree.
///
/// Created once via append; mutated afterwards only through the store's
/// replace/partial-update operations. `parent_message_id == None` marks a
/// tree root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// Parent node id; `None` for a tree root.
    #[serde(
        rename = "parentMessageId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_message_id: Option<String>,
    /// Message author role.
    pub role: Role,
    /// Bookkeeping kind.
    #[serde(
        rename = "messageKind",
        default,
        skip_serializing_if = "MessageKind::is_normal"
    )]
    pub message_kind: MessageKind,
    /// Ordered typed content blocks.
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    /// Opaque structured metadata (usage, timing, agent identity, ...).
    #[serde(default, skip_serializing_if = "MetadataMap::is_empty")]
    pub metadata: MetadataMap,
    /// Creation time, unix millis. Sibling order sorts on this (id breaks ties).
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    /// Last mutation time, unix millis.
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
}

impl Message {
    /// Create an empty message with a fresh id and timestamps.
    pub fn new(role: Role) -> Self {
        let now = now_millis();
        Self {
            id: gen_message_id(),
            parent_message_id: None,
            role,
            message_kind: MessageKind::default(),
            parts: Vec::new(),
            metadata: MetadataMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User).with_part(MessagePart::text(text))
    }

    /// Create an empty assistant message.
    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    /// Create a system message with a single text part.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System).with_part(MessagePart::text(text))
    }

    /// Set the parent id.
    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_message_id = Some(parent_id.into());
        self
    }

    /// Set the message kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.message_kind = kind;
        self
    }

    /// Append a part.
    #[must_use]
    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    /// Replace all parts.
    #[must_use]
    pub fn with_parts(mut self, parts: impl IntoIterator<Item = MessagePart>) -> Self {
        self.parts = parts.into_iter().collect();
        self
    }

    /// Insert one metadata entry.
    #[must_use]
    pub fn with_metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// All text-part content concatenated.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}
