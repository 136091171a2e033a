use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_agent_loop::TurnRunner;
use arbor_chat_store::{ChatStore, ChatStoreError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Shared application state, cloned into every handler.
///
/// The active-turn registry lives here rather than in a process global so
/// concurrent requests stay isolated and tests can build independent
/// instances.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ChatStore>,
    pub runner: Arc<TurnRunner>,
    active_turns: Arc<RwLock<HashMap<String, ActiveTurn>>>,
    next_seq: Arc<AtomicU64>,
}

struct ActiveTurn {
    seq: u64,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(store: Arc<ChatStore>, runner: Arc<TurnRunner>) -> Self {
        Self {
            store,
            runner,
            active_turns: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a fresh cancellation token for a session's turn. A turn
    /// already running for the same session is cancelled first; the abort
    /// endpoint only ever signals the newest one.
    pub async fn register_turn(&self, session_id: &str) -> (u64, CancellationToken) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let registration = ActiveTurn {
            seq,
            cancel: cancel.clone(),
        };
        let mut turns = self.active_turns.write().await;
        if let Some(previous) = turns.insert(session_id.to_string(), registration) {
            previous.cancel.cancel();
        }
        (seq, cancel)
    }

    /// Cancels the session's running turn, if any. Returns whether a turn
    /// was signalled. The entry stays registered; the turn task removes it
    /// once it has wound down and persisted.
    pub async fn abort_turn(&self, session_id: &str) -> bool {
        let turns = self.active_turns.read().await;
        match turns.get(session_id) {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops a turn's registration. The seq guard keeps a slow finisher
    /// from unregistering a newer turn on the same session.
    pub async fn finish_turn(&self, session_id: &str, seq: u64) {
        let mut turns = self.active_turns.write().await;
        if turns.get(session_id).is_some_and(|turn| turn.seq == seq) {
            turns.remove(session_id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match &self {
            ApiError::MessageNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        let body = Json(serde_json::json!({ "error": msg }));
        (code, body).into_response()
    }
}

impl From<ChatStoreError> for ApiError {
    fn from(e: ChatStoreError) -> Self {
        match e {
            ChatStoreError::InvalidSessionId(id) => {
                ApiError::BadRequest(format!("invalid session id: {id:?}"))
            }
            ChatStoreError::MessageNotFound(id) | ChatStoreError::ParentNotFound(id) => {
                ApiError::MessageNotFound(id)
            }
            ChatStoreError::MessageExists(id) => {
                ApiError::BadRequest(format!("message already exists: {id}"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
