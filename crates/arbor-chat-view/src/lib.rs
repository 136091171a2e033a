//! Branch resolution and view projection for branching chat sessions.
//!
//! A session's messages form a tree, but clients render one linear
//! conversation at a time. The [`resolver`] module picks which leaf that
//! conversation ends at; the [`projector`] turns the chosen branch into a
//! [`ChatView`] ready for the wire. Both operate on an in-memory
//! [`MessageTree`](arbor_chat_model::MessageTree) snapshot and never mutate
//! it, so callers can project concurrently with writers.

mod projector;
mod resolver;

pub use projector::{project_chat_view, AnchorStrategy, ChatView, ViewAnchor, ViewRequest};
pub use resolver::{
    build_sibling_nav_for_chain, resolve_chain_from_leaf, resolve_latest_leaf_in_subtree,
    resolve_rightmost_leaf, SiblingNav,
};
