//! Structural index over one session's messages.

use crate::message::Message;
use std::collections::HashMap;

/// In-memory structural view of a session's message tree.
///
/// Pure data: byId lookup, parent-to-children edges, and root ids. Children and
/// roots are ordered by `(created_at, id)`, so "last child" always means the
/// newest branch. Built fresh from a message list; never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct MessageTree {
    by_id: HashMap<String, Message>,
    children_of: HashMap<String, Vec<String>>,
    root_ids: Vec<String>,
}

impl MessageTree {
    /// Build the index from a message list.
    ///
    /// A message whose parent id is not present in the list is indexed as a
    /// root; that keeps every node reachable when callers pre-filter roles.
    pub fn build(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut ordered: Vec<Message> = messages.into_iter().collect();
        ordered.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut by_id: HashMap<String, Message> = HashMap::with_capacity(ordered.len());
        for msg in &ordered {
            by_id.insert(msg.id.clone(), msg.clone());
        }

        let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
        let mut root_ids = Vec::new();
        for msg in &ordered {
            match msg
                .parent_message_id
                .as_ref()
                .filter(|pid| by_id.contains_key(*pid))
            {
                Some(pid) => children_of
                    .entry(pid.clone())
                    .or_default()
                    .push(msg.id.clone()),
                None => root_ids.push(msg.id.clone()),
            }
        }

        Self {
            by_id,
            children_of,
            root_ids,
        }
    }

    /// Look up a message by id.
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.by_id.get(id)
    }

    /// Whether the tree contains `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Ordered child ids of `parent_id` (empty if none).
    pub fn children(&self, parent_id: &str) -> &[String] {
        self.children_of
            .get(parent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ordered root ids.
    pub fn root_ids(&self) -> &[String] {
        &self.root_ids
    }

    /// Number of indexed messages.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the tree has no messages.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterate over all indexed messages (no particular order).
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.by_id.values()
    }
}
