//! The queue abstraction the ingest loop reads from.

use async_trait::async_trait;

use crate::error::IngestError;

/// One record fetched from the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueMessage {
    /// Topic it came from.
    pub topic: String,
    /// Partition it came from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key, if any.
    pub key: Option<Vec<u8>>,
    /// Raw record value.
    pub payload: Vec<u8>,
}

impl QueueMessage {
    /// Message with only a payload set.
    pub fn from_payload(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }
}

/// At-least-once message source with explicit acknowledgement.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next message.
    ///
    /// Returns [`IngestError::Closed`] once no more messages will arrive.
    async fn fetch(&mut self) -> Result<QueueMessage, IngestError>;

    /// Acknowledge `message` so it is not redelivered.
    async fn commit(&mut self, message: &QueueMessage) -> Result<(), IngestError>;
}
