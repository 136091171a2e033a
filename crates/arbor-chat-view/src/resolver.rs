//! Pure branch-resolution algorithms over a [`MessageTree`].
//!
//! Sibling lists inside the tree are ordered by `(createdAt, id)`, so the
//! last child at every level is always the newest branch. "Rightmost"
//! descent therefore lands on the most recent leaf without consulting
//! timestamps again.

use std::collections::{HashMap, HashSet};

use arbor_chat_model::MessageTree;
use serde::{Deserialize, Serialize};

/// Sibling navigation info for one message on the active chain.
///
/// `sibling_index` is 1-based. `prev_sibling_id` is `None` exactly when the
/// message is the first sibling, `next_sibling_id` exactly when it is the
/// last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiblingNav {
    pub sibling_index: usize,
    pub sibling_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_sibling_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sibling_id: Option<String>,
}

/// Walks parent pointers from `leaf_id` up to its root and returns the ids
/// in root-to-leaf order. Unknown leaf ids yield an empty chain.
pub fn resolve_chain_from_leaf(tree: &MessageTree, leaf_id: &str) -> Vec<String> {
    if !tree.contains(leaf_id) {
        return Vec::new();
    }
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(leaf_id.to_string());
    while let Some(id) = cursor {
        if !seen.insert(id.clone()) {
            break;
        }
        let Some(message) = tree.get(&id) else { break };
        chain.push(id);
        cursor = message.parent_message_id.clone();
    }
    chain.reverse();
    chain
}

/// Returns the newest leaf of the whole tree: start at the last root and
/// descend into the last child until a childless node. `None` for an empty
/// tree.
pub fn resolve_rightmost_leaf(tree: &MessageTree) -> Option<String> {
    let start = tree.root_ids().last()?.clone();
    Some(descend_last_child(tree, start))
}

/// Rightmost descent scoped under `root_id`. Returns `root_id` itself when
/// it has no children, `None` when it is absent from the tree.
pub fn resolve_latest_leaf_in_subtree(tree: &MessageTree, root_id: &str) -> Option<String> {
    if !tree.contains(root_id) {
        return None;
    }
    Some(descend_last_child(tree, root_id.to_string()))
}

fn descend_last_child(tree: &MessageTree, start: String) -> String {
    let mut cursor = start;
    let mut seen = HashSet::new();
    loop {
        if !seen.insert(cursor.clone()) {
            return cursor;
        }
        match tree.children(&cursor).last() {
            Some(next) => cursor = next.clone(),
            None => return cursor,
        }
    }
}

/// Computes [`SiblingNav`] for every id on the chain.
///
/// Siblings are the ordered children of the message's parent; messages
/// whose parent is missing from the tree share the root list instead,
/// mirroring how [`MessageTree::build`] roots them.
pub fn build_sibling_nav_for_chain(
    tree: &MessageTree,
    chain_ids: &[String],
) -> HashMap<String, SiblingNav> {
    let mut nav = HashMap::with_capacity(chain_ids.len());
    for id in chain_ids {
        let Some(message) = tree.get(id) else { continue };
        let parent = message
            .parent_message_id
            .as_deref()
            .filter(|pid| tree.contains(pid));
        let siblings: &[String] = match parent {
            Some(pid) => tree.children(pid),
            None => tree.root_ids(),
        };
        let Some(pos) = siblings.iter().position(|sibling| sibling == id) else {
            continue;
        };
        nav.insert(
            id.clone(),
            SiblingNav {
                sibling_index: pos + 1,
                sibling_total: siblings.len(),
                prev_sibling_id: pos.checked_sub(1).and_then(|p| siblings.get(p)).cloned(),
                next_sibling_id: siblings.get(pos + 1).cloned(),
            },
        );
    }
    nav
}
