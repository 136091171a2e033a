//! Core data model for branching chat sessions.
//!
//! A session's history is a tree, not a log: every message points at an
//! optional parent, edits and regenerations fork new branches, and one
//! root-to-leaf chain is the linear history a client displays at a time.
//!
//! This crate holds the data only:
//! - [`Message`] with its typed [`MessagePart`] content blocks
//! - [`MessageTree`], the structural index (byId / childrenOf / rootIds)
//!
//! Storage, branch resolution and streaming live in sibling crates.

mod message;
mod part;
mod tree;

pub use message::{gen_message_id, now_millis, Message, MessageKind, MetadataMap, Role};
pub use part::{MessagePart, ToolCallState};
pub use tree::MessageTree;
