use thiserror::Error;

/// Failures produced by the feed pipeline and connection manager.
///
/// Only `Auth`, `Server` and exhausted `Transport` errors reach error subscribers;
/// `Protocol` and `Normalization` are contained per frame and logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("normalization error: {0}")]
    Normalization(String),
    #[error("server error: {0}")]
    Server(String),
}

impl FeedError {
    /// Whether this error is terminal for the current session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedError::Auth(_))
    }
}
