//! Ingestion error types.

use thiserror::Error;

/// Errors raised by a [`MessageSource`](crate::MessageSource).
#[derive(Debug, Error)]
pub enum IngestError {
    /// Fetching the next message failed. The loop retries.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Acknowledging a message failed. The message may be redelivered.
    #[error("commit failed: {0}")]
    Commit(String),
    /// The source has no more messages.
    #[error("source closed")]
    Closed,
    /// The consumer could not be created.
    #[error("invalid consumer config: {0}")]
    Config(String),
}
