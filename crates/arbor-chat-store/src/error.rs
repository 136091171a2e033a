//! Store error type.

/// Errors surfaced by [`ChatStore`](crate::ChatStore) operations.
///
/// Corrupted on-disk state maps to [`Serialization`](Self::Serialization)
/// and fails the call; the store never substitutes a default for a file it
/// cannot parse.
#[derive(Debug, thiserror::Error)]
pub enum ChatStoreError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("parent message not found: {0}")]
    ParentNotFound(String),

    #[error("message already exists: {0}")]
    MessageExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ChatStoreError {
    fn from(err: serde_json::Error) -> Self {
        ChatStoreError::Serialization(err.to_string())
    }
}
