use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use genai::chat::{ChatOptions, ChatRequest, ChatStreamEvent};
use genai::Client;

use crate::error::TurnError;

/// Boxed stream of model events with provider failures already mapped into
/// the turn error taxonomy.
pub type LlmEventStream = Pin<Box<dyn Stream<Item = Result<ChatStreamEvent, TurnError>> + Send>>;

/// Seam between the turn runner and the model provider.
///
/// Implementations wrap a real client or script canned event streams in
/// tests. Provider errors are mapped to [`TurnError::UpstreamModel`] at this
/// boundary so callers never see provider-specific error types.
#[async_trait]
pub trait LlmExecutor: Send + Sync {
    async fn exec_chat_stream_events(
        &self,
        model: &str,
        chat_req: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<LlmEventStream, TurnError>;

    /// Executor name for logging.
    fn name(&self) -> &'static str;
}

/// Production executor backed by the genai multi-provider client.
#[derive(Debug, Clone, Default)]
pub struct GenaiLlmExecutor {
    client: Client,
}

impl GenaiLlmExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LlmExecutor for GenaiLlmExecutor {
    async fn exec_chat_stream_events(
        &self,
        model: &str,
        chat_req: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<LlmEventStream, TurnError> {
        let stream_resp = self
            .client
            .exec_chat_stream(model, chat_req, options)
            .await
            .map_err(|e| TurnError::UpstreamModel(e.to_string()))?;
        Ok(Box::pin(stream_resp.stream.map(|item| {
            item.map_err(|e| TurnError::UpstreamModel(e.to_string()))
        })))
    }

    fn name(&self) -> &'static str {
        "genai"
    }
}

/// Resolved model handle: the effective model id plus the executor that
/// serves it.
#[derive(Clone)]
pub struct ResolvedModel {
    pub model: String,
    pub executor: Arc<dyn LlmExecutor>,
}

/// Maps an optional per-request model id to a concrete handle.
///
/// Resolution failure is a distinct error kind so callers can tell "you
/// asked for a model that does not exist" apart from "the provider fell
/// over mid-call".
#[async_trait]
pub trait ModelResolver: Send + Sync {
    async fn resolve(&self, model_id: Option<&str>) -> Result<ResolvedModel, TurnError>;
}

/// Resolver with a single executor and a configured default model id.
///
/// A request-supplied id overrides the default verbatim; there is no
/// catalog lookup at this layer.
pub struct StaticModelResolver {
    default_model: String,
    executor: Arc<dyn LlmExecutor>,
}

impl StaticModelResolver {
    pub fn new(default_model: impl Into<String>, executor: Arc<dyn LlmExecutor>) -> Self {
        Self {
            default_model: default_model.into(),
            executor,
        }
    }
}

#[async_trait]
impl ModelResolver for StaticModelResolver {
    async fn resolve(&self, model_id: Option<&str>) -> Result<ResolvedModel, TurnError> {
        let model = model_id
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model);
        if model.trim().is_empty() {
            return Err(TurnError::ModelUnavailable(
                "no model id supplied and no default configured".to_string(),
            ));
        }
        Ok(ResolvedModel {
            model: model.to_string(),
            executor: Arc::clone(&self.executor),
        })
    }
}
