//! Projects a message tree into a UI-ready chat view.

use std::collections::HashMap;

use arbor_chat_model::{Message, MessageKind, MessageTree, Role};
use serde::{Deserialize, Serialize};

use crate::resolver::{
    build_sibling_nav_for_chain, resolve_chain_from_leaf, resolve_latest_leaf_in_subtree,
    resolve_rightmost_leaf, SiblingNav,
};

/// How an anchor id selects the view's leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorStrategy {
    /// Use the anchor id verbatim, freezing the view at that message even
    /// when newer descendants exist.
    #[serde(rename = "self")]
    SelfMessage,
    /// Follow the newest branch under the anchor down to its leaf.
    #[serde(rename = "latestLeafInSubtree")]
    LatestLeafInSubtree,
}

/// Pins the projected view to a message instead of the global newest leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewAnchor {
    pub message_id: String,
    pub strategy: AnchorStrategy,
}

/// What to project and how much of it to hydrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<ViewAnchor>,
    #[serde(default)]
    pub include_messages: bool,
    #[serde(default)]
    pub include_sibling_nav: bool,
}

/// Derived, non-persisted snapshot of one branch of the session tree.
///
/// `branch_message_ids` always lists the full chain; `messages` (when
/// hydrated) omits internal bookkeeping nodes, so the two are not
/// guaranteed to be the same length.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_message_id: Option<String>,
    pub branch_message_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling_nav: Option<HashMap<String, SiblingNav>>,
}

/// Project one branch of `tree` into a [`ChatView`].
///
/// Leaf selection: no anchor resolves the rightmost leaf of the whole
/// tree; a `self` anchor is taken verbatim; a `latestLeafInSubtree`
/// anchor descends to the newest leaf under the anchor. Pure over the
/// given snapshot; an empty tree projects an empty chain.
pub fn project_chat_view(tree: &MessageTree, request: &ViewRequest) -> ChatView {
    let leaf_message_id = match &request.anchor {
        None => resolve_rightmost_leaf(tree),
        Some(anchor) => match anchor.strategy {
            AnchorStrategy::SelfMessage => Some(anchor.message_id.clone()),
            AnchorStrategy::LatestLeafInSubtree => {
                resolve_latest_leaf_in_subtree(tree, &anchor.message_id)
            }
        },
    };

    let branch_message_ids = leaf_message_id
        .as_deref()
        .map(|leaf| resolve_chain_from_leaf(tree, leaf))
        .unwrap_or_default();

    let messages = request.include_messages.then(|| {
        branch_message_ids
            .iter()
            .filter_map(|id| tree.get(id))
            .filter(|message| is_displayable(message))
            .cloned()
            .collect()
    });

    let sibling_nav = request
        .include_sibling_nav
        .then(|| build_sibling_nav_for_chain(tree, &branch_message_ids));

    ChatView {
        leaf_message_id,
        branch_message_ids,
        messages,
        sibling_nav,
    }
}

fn is_displayable(message: &Message) -> bool {
    message.role != Role::Subagent && message.message_kind != MessageKind::CompactPrompt
}
