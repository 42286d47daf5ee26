use crate::domain::{MessageId, SessionId};

/// Core error type for the delivery engine.
///
/// Transport and store adapters map their failures into `External` so the
/// engine can decide between aborting a broadcast and retrying it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("named list not found: {0}")]
    NamedListNotFound(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The first send of a broadcast did not yield a message id.
    #[error("anchor send failed, broadcast aborted: {reason}")]
    FatalAnchor { reason: String },

    /// A batch failed mid-broadcast. Counters describe progress at failure time.
    #[error(
        "batch {batch_index} ({batch_size} recipients) failed after {delivered} delivered in {batches_completed} batches: {reason}"
    )]
    BatchTransport {
        batch_index: usize,
        batch_size: usize,
        delivered: usize,
        batches_completed: usize,
        anchor: Option<MessageId>,
        reason: String,
    },

    #[error("gave up after {attempts} attempts: {source}")]
    QueueExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("session {0} is not connected")]
    SessionUnavailable(SessionId),

    #[error("isolation depth {depth} exceeded, {remaining} addresses marked problematic")]
    IsolationDepthExceeded { depth: u32, remaining: usize },

    #[error("queue worker for session {0} went away")]
    QueueClosed(SessionId),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether resubmitting the same work could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BatchTransport { .. } | Error::External(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
