//! File-backed storage for branching chat sessions.
//!
//! Each session lives in its own directory under the store root:
//! `messages.json` holds the full message list, `session.json` holds the
//! session-level document (title, pin state, last error, ...). Every
//! mutation against one session is serialized by a per-session async mutex
//! and lands via an atomic temp-file-and-rename, so concurrent appends
//! never lose writes and readers always see a complete file.

mod error;
mod store;

pub use error::ChatStoreError;
pub use store::{shallow_merge, ChatStore, SubtreeDeletion};
