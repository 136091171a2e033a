//! Per-session file store: message CRUD, tree/chain loading, session doc.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arbor_chat_model::{now_millis, Message, MessageTree, MetadataMap, Role};
use arbor_chat_view::resolve_chain_from_leaf;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ChatStoreError;

const MESSAGES_FILE: &str = "messages.json";
const SESSION_DOC_FILE: &str = "session.json";

/// Outcome of a subtree deletion: how many nodes went away and where the
/// UI should refocus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtreeDeletion {
    pub deleted_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
}

/// On-disk envelope for a session's message list.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MessagesFile {
    #[serde(default)]
    messages: Vec<Message>,
}

/// Shallow-merge `patch` into `target`: non-null values overwrite per key,
/// `null` removes the key, untouched keys survive.
pub fn shallow_merge(target: &mut MetadataMap, patch: MetadataMap) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

/// File-backed chat store.
///
/// Mutations take the session's mutex and rewrite the whole messages file
/// atomically. Reads parse the current file without locking; rename
/// atomicity guarantees they never observe a partial write, only a
/// point-in-time snapshot.
pub struct ChatStore {
    base_path: PathBuf,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChatStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new message node.
    ///
    /// Fails with [`ChatStoreError::ParentNotFound`] when the parent id is
    /// set but absent, and [`ChatStoreError::MessageExists`] on a duplicate
    /// id. Returns the stored message.
    pub async fn append_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<Message, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut messages = read_messages_in(&dir, session_id).await?;
        if messages.iter().any(|m| m.id == message.id) {
            return Err(ChatStoreError::MessageExists(message.id));
        }
        if let Some(parent_id) = &message.parent_message_id {
            if !messages.iter().any(|m| &m.id == parent_id) {
                return Err(ChatStoreError::ParentNotFound(parent_id.clone()));
            }
        }
        messages.push(message.clone());
        write_messages_in(&dir, &messages).await?;
        Ok(message)
    }

    /// Replace an existing node's mutable fields (parts, metadata, kind),
    /// keyed by id. Identity fields (id, parent, role, creation time) are
    /// kept from the stored node; no version check, last write under the
    /// mutex wins.
    pub async fn update_message(
        &self,
        session_id: &str,
        message: Message,
    ) -> Result<Message, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut messages = read_messages_in(&dir, session_id).await?;
        let Some(stored) = messages.iter_mut().find(|m| m.id == message.id) else {
            return Err(ChatStoreError::MessageNotFound(message.id));
        };
        stored.parts = message.parts;
        stored.metadata = message.metadata;
        stored.message_kind = message.message_kind;
        stored.updated_at = now_millis();
        let updated = stored.clone();
        write_messages_in(&dir, &messages).await?;
        Ok(updated)
    }

    /// Replace only the parts of a message. Returns `false` when the id is
    /// absent.
    pub async fn update_message_parts(
        &self,
        session_id: &str,
        message_id: &str,
        parts: Vec<arbor_chat_model::MessagePart>,
    ) -> Result<bool, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut messages = read_messages_in(&dir, session_id).await?;
        let Some(stored) = messages.iter_mut().find(|m| m.id == message_id) else {
            return Ok(false);
        };
        stored.parts = parts;
        stored.updated_at = now_millis();
        write_messages_in(&dir, &messages).await?;
        Ok(true)
    }

    /// Shallow-merge `patch` into a message's metadata. Returns the merged
    /// map, or `None` when the id is absent. Untouched keys are preserved;
    /// a `null` value removes its key.
    pub async fn update_message_metadata(
        &self,
        session_id: &str,
        message_id: &str,
        patch: MetadataMap,
    ) -> Result<Option<MetadataMap>, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut messages = read_messages_in(&dir, session_id).await?;
        let Some(stored) = messages.iter_mut().find(|m| m.id == message_id) else {
            return Ok(None);
        };
        shallow_merge(&mut stored.metadata, patch);
        stored.updated_at = now_millis();
        let merged = stored.metadata.clone();
        write_messages_in(&dir, &messages).await?;
        Ok(Some(merged))
    }

    pub async fn get_message_by_id(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let messages = read_messages_in(&dir, session_id).await?;
        Ok(messages.into_iter().find(|m| m.id == message_id))
    }

    /// Count of messages on the visible timeline. Sub-agent turns are
    /// internal and never counted.
    pub async fn get_message_count(&self, session_id: &str) -> Result<usize, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let messages = read_messages_in(&dir, session_id).await?;
        Ok(messages.iter().filter(|m| m.role != Role::Subagent).count())
    }

    /// Remove a message and all its transitive descendants.
    ///
    /// Returns the exact number of removed nodes and the former parent id
    /// so the caller can refocus the view there.
    pub async fn delete_message_subtree(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<SubtreeDeletion, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut messages = read_messages_in(&dir, session_id).await?;
        let Some(target) = messages.iter().find(|m| m.id == message_id) else {
            return Err(ChatStoreError::MessageNotFound(message_id.to_string()));
        };
        let parent_message_id = target.parent_message_id.clone();

        let doomed = {
            let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
            for m in &messages {
                if let Some(pid) = m.parent_message_id.as_deref() {
                    children.entry(pid).or_default().push(m.id.as_str());
                }
            }
            let mut doomed: HashSet<String> = HashSet::new();
            let mut stack = vec![message_id.to_string()];
            while let Some(current) = stack.pop() {
                if doomed.insert(current.clone()) {
                    if let Some(kids) = children.get(current.as_str()) {
                        stack.extend(kids.iter().map(|k| k.to_string()));
                    }
                }
            }
            doomed
        };

        let before = messages.len();
        messages.retain(|m| !doomed.contains(&m.id));
        let deleted_count = before - messages.len();
        write_messages_in(&dir, &messages).await?;

        Ok(SubtreeDeletion {
            deleted_count,
            parent_message_id,
        })
    }

    /// Build a fresh tree index from the session's current messages.
    pub async fn load_message_tree(&self, session_id: &str) -> Result<MessageTree, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let messages = read_messages_in(&dir, session_id).await?;
        Ok(MessageTree::build(messages))
    }

    /// Load the root-to-leaf chain ending at `leaf_id`, with sub-agent
    /// turns filtered out. With `max_messages`, only the tail nearest the
    /// leaf is kept, order preserved.
    pub async fn load_message_chain(
        &self,
        session_id: &str,
        leaf_id: &str,
        max_messages: Option<usize>,
    ) -> Result<Vec<Message>, ChatStoreError> {
        let tree = self.load_message_tree(session_id).await?;
        let chain_ids = resolve_chain_from_leaf(&tree, leaf_id);
        let mut chain: Vec<Message> = chain_ids
            .iter()
            .filter_map(|id| tree.get(id))
            .filter(|m| m.role != Role::Subagent)
            .cloned()
            .collect();
        if let Some(max) = max_messages {
            if chain.len() > max {
                chain.drain(..chain.len() - max);
            }
        }
        Ok(chain)
    }

    /// Read the session-level document; `None` when it was never written.
    pub async fn read_session_json(
        &self,
        session_id: &str,
    ) -> Result<Option<Value>, ChatStoreError> {
        let path = self.session_dir(session_id)?.join(SESSION_DOC_FILE);
        match read_file(&path).await? {
            Some(raw) => {
                let doc: Value = serde_json::from_str(&raw).map_err(|e| {
                    ChatStoreError::Serialization(format!(
                        "session document for '{session_id}': {e}"
                    ))
                })?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Shallow-merge `patch` into the session-level document and return
    /// the merged document. A `null` value removes its key.
    pub async fn write_session_json(
        &self,
        session_id: &str,
        patch: MetadataMap,
    ) -> Result<Value, ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        let mut doc = match read_file(&dir.join(SESSION_DOC_FILE)).await? {
            Some(raw) => {
                let value: Value = serde_json::from_str(&raw).map_err(|e| {
                    ChatStoreError::Serialization(format!(
                        "session document for '{session_id}': {e}"
                    ))
                })?;
                match value {
                    Value::Object(map) => map,
                    other => {
                        return Err(ChatStoreError::Serialization(format!(
                            "session document for '{session_id}' is not an object: {other}"
                        )))
                    }
                }
            }
            None => MetadataMap::new(),
        };
        shallow_merge(&mut doc, patch);
        let json = serde_json::to_string_pretty(&Value::Object(doc.clone()))?;
        write_atomic(&dir, SESSION_DOC_FILE, json).await?;
        Ok(Value::Object(doc))
    }

    /// Remove the session's messages and document. Idempotent: deleting a
    /// session that does not exist succeeds.
    pub async fn delete_session_files(&self, session_id: &str) -> Result<(), ChatStoreError> {
        let dir = self.session_dir(session_id)?;
        let lock = self.session_lock(session_id).await;
        {
            let _guard = lock.lock().await;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        drop(lock);
        // A task parked between session_lock and lock must keep resolving
        // to the same mutex, so the entry is evicted only while the map
        // holds the sole reference.
        let mut locks = self.session_locks.lock().await;
        if let Some(entry) = locks.get(session_id) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(session_id);
            }
        }
        Ok(())
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, ChatStoreError> {
        validate_session_id(session_id)?;
        Ok(self.base_path.join(session_id))
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl std::fmt::Debug for ChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStore")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

/// Session ids become directory names, so anything that could escape the
/// store root is rejected.
fn validate_session_id(session_id: &str) -> Result<(), ChatStoreError> {
    if session_id.is_empty() {
        return Err(ChatStoreError::InvalidSessionId(session_id.to_string()));
    }
    if session_id.contains('/')
        || session_id.contains('\\')
        || session_id.contains("..")
        || session_id.contains('\0')
    {
        return Err(ChatStoreError::InvalidSessionId(session_id.to_string()));
    }
    if session_id.chars().any(|c| c.is_control()) {
        return Err(ChatStoreError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

async fn read_file(path: &Path) -> Result<Option<String>, ChatStoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_messages_in(dir: &Path, session_id: &str) -> Result<Vec<Message>, ChatStoreError> {
    match read_file(&dir.join(MESSAGES_FILE)).await? {
        Some(raw) => {
            let file: MessagesFile = serde_json::from_str(&raw).map_err(|e| {
                ChatStoreError::Serialization(format!("messages file for '{session_id}': {e}"))
            })?;
            Ok(file.messages)
        }
        None => Ok(Vec::new()),
    }
}

async fn write_messages_in(dir: &Path, messages: &[Message]) -> Result<(), ChatStoreError> {
    let file = MessagesFile {
        messages: messages.to_vec(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    write_atomic(dir, MESSAGES_FILE, json).await
}

/// Write `json` to `dir/file_name` via a temp file and rename, fsyncing
/// before the swap. The temp file is cleaned up on failure.
async fn write_atomic(dir: &Path, file_name: &str, json: String) -> Result<(), ChatStoreError> {
    tokio::fs::create_dir_all(dir).await?;
    let final_path = dir.join(file_name);
    let tmp_path = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let write_result: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        match tokio::fs::rename(&tmp_path, &final_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tokio::fs::remove_file(&final_path).await?;
                tokio::fs::rename(&tmp_path, &final_path).await
            }
            Err(e) => Err(e),
        }
    }
    .await;

    if let Err(e) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}
