//! Route table and request handlers.

use std::collections::HashMap;

use arbor_agent_loop::TurnRequest;
use arbor_chat_model::Message;
use arbor_chat_store::SubtreeDeletion;
use arbor_chat_view::{
    project_chat_view, resolve_rightmost_leaf, AnchorStrategy, ChatView, ViewAnchor, ViewRequest,
};
use arbor_protocol_ui_stream::sse_frame;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::service::ApiError;
use crate::sse::{sse_body_stream, sse_response, DONE_TRAILER};

pub use crate::service::AppState;

pub const HEALTH_PATH: &str = "/health";
pub const SESSION_PATH: &str = "/v1/sessions/:id";
pub const SESSION_CHAT_PATH: &str = "/v1/sessions/:id/chat";
pub const SESSION_ABORT_PATH: &str = "/v1/sessions/:id/abort";
pub const SESSION_VIEW_PATH: &str = "/v1/sessions/:id/view";
pub const SESSION_DOC_PATH: &str = "/v1/sessions/:id/doc";
pub const SESSION_STATS_PATH: &str = "/v1/sessions/:id/stats";
pub const MESSAGE_PATH: &str = "/v1/sessions/:id/messages/:message_id";
pub const MESSAGE_METADATA_PATH: &str = "/v1/sessions/:id/messages/:message_id/metadata";

pub fn health_routes() -> Router<AppState> {
    Router::new().route(HEALTH_PATH, get(health))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route(SESSION_PATH, delete(delete_session))
        .route(SESSION_CHAT_PATH, post(run_chat))
        .route(SESSION_ABORT_PATH, post(abort_chat))
        .route(SESSION_VIEW_PATH, get(get_view))
        .route(SESSION_DOC_PATH, get(get_doc).patch(patch_doc))
        .route(SESSION_STATS_PATH, get(get_stats))
        .route(MESSAGE_PATH, get(get_message).delete(delete_message))
        .route(MESSAGE_METADATA_PATH, patch(patch_message_metadata))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(session_routes())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Body of `POST /v1/sessions/:id/chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    /// User message text. Absent for approval-resume requests.
    #[serde(default)]
    pub text: Option<String>,
    /// Where the new user message branches from; defaults to the current
    /// rightmost leaf.
    #[serde(default)]
    pub parent_message_id: Option<String>,
    /// Per-request model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Approval answers keyed by tool call id.
    #[serde(default)]
    pub tool_answers: HashMap<String, Value>,
    /// Tail limit on the history replayed to the model.
    #[serde(default)]
    pub max_messages: Option<usize>,
}

/// Appends the user message (when text is present) and streams one agent
/// turn as SSE. The turn keeps running on client disconnect only long
/// enough to persist its outcome.
async fn run_chat(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ChatRequestBody>,
) -> Result<Response, ApiError> {
    let text = body
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if text.is_none() && body.tool_answers.is_empty() {
        return Err(ApiError::BadRequest(
            "request must include text or tool answers".to_string(),
        ));
    }

    let parent_id = match text {
        Some(text) => {
            let parent = match body.parent_message_id.clone() {
                Some(id) => Some(id),
                None => {
                    let tree = st.store.load_message_tree(&session_id).await?;
                    resolve_rightmost_leaf(&tree)
                }
            };
            let mut user = Message::user(text);
            user.parent_message_id = parent;
            let user = st.store.append_message(&session_id, user).await?;
            Some(user.id)
        }
        // Approval resume: no new user node, the turn reattaches to the
        // requested parent or the current leaf.
        None => body.parent_message_id.clone(),
    };

    let request = TurnRequest {
        session_id: session_id.clone(),
        parent_message_id: parent_id,
        model: body.model.clone(),
        tool_answers: body.tool_answers,
        max_messages: body.max_messages,
    };

    let (seq, cancel) = st.register_turn(&session_id).await;
    let mut frames = st.runner.run_turn(request, cancel.clone());
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            let event = frame.into_wire();
            let chunk = match sse_frame(&event) {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(error = %err, "failed to serialize stream record");
                    continue;
                }
            };
            if tx.send(chunk).await.is_err() {
                // Receiver dropped means the client disconnected. Cancel
                // the turn but keep draining; persistence happens at the
                // end of the frame stream.
                cancel.cancel();
            }
        }
        let _ = tx.send(Bytes::from_static(DONE_TRAILER)).await;
        st.finish_turn(&session_id, seq).await;
    });

    Ok(sse_response(sse_body_stream(rx)))
}

async fn abort_chat(State(st): State<AppState>, Path(session_id): Path<String>) -> Json<Value> {
    let aborted = st.abort_turn(&session_id).await;
    Json(json!({ "aborted": aborted }))
}

#[derive(Debug, Deserialize)]
struct ViewParams {
    #[serde(default)]
    anchor_message_id: Option<String>,
    /// `self` freezes the view at the anchor; anything else follows the
    /// newest branch under it.
    #[serde(default)]
    anchor_strategy: Option<String>,
    #[serde(default)]
    include_messages: bool,
    #[serde(default)]
    include_sibling_nav: bool,
}

fn parse_view_request(params: &ViewParams) -> ViewRequest {
    let anchor = params
        .anchor_message_id
        .clone()
        .map(|message_id| ViewAnchor {
            message_id,
            strategy: match params.anchor_strategy.as_deref() {
                Some("self") => AnchorStrategy::SelfMessage,
                _ => AnchorStrategy::LatestLeafInSubtree,
            },
        });
    ViewRequest {
        anchor,
        include_messages: params.include_messages,
        include_sibling_nav: params.include_sibling_nav,
    }
}

async fn get_view(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<ViewParams>,
) -> Result<Json<ChatView>, ApiError> {
    let request = parse_view_request(&params);
    let tree = st.store.load_message_tree(&session_id).await?;
    Ok(Json(project_chat_view(&tree, &request)))
}

async fn get_doc(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let doc = st.store.read_session_json(&session_id).await?;
    Ok(Json(doc.unwrap_or_else(|| json!({}))))
}

async fn patch_doc(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let Value::Object(patch) = patch else {
        return Err(ApiError::BadRequest(
            "document patch must be a JSON object".to_string(),
        ));
    };
    let doc = st.store.write_session_json(&session_id, patch).await?;
    Ok(Json(doc))
}

async fn get_stats(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message_count = st.store.get_message_count(&session_id).await?;
    Ok(Json(json!({ "messageCount": message_count })))
}

async fn get_message(
    State(st): State<AppState>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Result<Json<Message>, ApiError> {
    let Some(message) = st
        .store
        .get_message_by_id(&session_id, &message_id)
        .await?
    else {
        return Err(ApiError::MessageNotFound(message_id));
    };
    Ok(Json(message))
}

async fn delete_message(
    State(st): State<AppState>,
    Path((session_id, message_id)): Path<(String, String)>,
) -> Result<Json<SubtreeDeletion>, ApiError> {
    let outcome = st
        .store
        .delete_message_subtree(&session_id, &message_id)
        .await?;
    Ok(Json(outcome))
}

async fn patch_message_metadata(
    State(st): State<AppState>,
    Path((session_id, message_id)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let Value::Object(patch) = patch else {
        return Err(ApiError::BadRequest(
            "metadata patch must be a JSON object".to_string(),
        ));
    };
    let Some(merged) = st
        .store
        .update_message_metadata(&session_id, &message_id, patch)
        .await?
    else {
        return Err(ApiError::MessageNotFound(message_id));
    };
    Ok(Json(Value::Object(merged)))
}

async fn delete_session(
    State(st): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    st.store.delete_session_files(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
