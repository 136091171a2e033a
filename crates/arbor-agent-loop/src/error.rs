use arbor_chat_store::ChatStoreError;

/// Failure taxonomy for a single agent turn.
///
/// `Validation` and `NotFound` are caller mistakes and surface before any
/// frame is emitted. `ModelUnavailable` means the resolver could not map a
/// model id to an executor, `UpstreamModel` is a provider-side failure from
/// an executor that did resolve. `Aborted` means the turn was cancelled
/// before it produced anything; cancellation mid-turn is not an error and
/// surfaces as `aborted` message metadata instead.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model call failed: {0}")]
    UpstreamModel(String),

    #[error("turn aborted")]
    Aborted,

    #[error(transparent)]
    Store(#[from] ChatStoreError),
}
