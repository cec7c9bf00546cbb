//! The consume-decode-publish-commit loop.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use relay_core::{Envelope, Publish, PublishOutcome, STATE_CHANGED_EVENT};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::IngestError;
use crate::metrics::{INGEST_COMMIT_ERRORS_TOTAL, INGEST_FETCH_ERRORS_TOTAL, INGEST_MESSAGES_TOTAL};
use crate::source::{MessageSource, QueueMessage};

/// Counters reported when the loop exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Messages fetched.
    pub received: u64,
    /// Envelopes queued for fan-out.
    pub published: u64,
    /// Envelopes the registry dropped or refused.
    pub dropped: u64,
    /// Messages that were not valid envelopes.
    pub skipped_malformed: u64,
    /// Valid envelopes of another kind or without a saga ID.
    pub filtered: u64,
    /// Fetch attempts that failed.
    pub fetch_errors: u64,
    /// Commits that failed.
    pub commit_failures: u64,
}

/// Reads a [`MessageSource`] and publishes routable envelopes.
///
/// Every fetched message is committed after it is handled, including
/// malformed and filtered ones. Publishing never blocks the loop.
pub struct IngestLoop<S> {
    source: S,
    publisher: Arc<dyn Publish>,
    event_type: String,
    retry_backoff: Duration,
}

impl<S: MessageSource> IngestLoop<S> {
    /// Route [`STATE_CHANGED_EVENT`] envelopes from `source` into `publisher`.
    pub fn new(source: S, publisher: Arc<dyn Publish>) -> Self {
        Self {
            source,
            publisher,
            event_type: STATE_CHANGED_EVENT.to_string(),
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Route a different event kind.
    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Delay before retrying a failed fetch.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Consume until `cancel` fires or the source closes.
    pub async fn run(mut self, cancel: CancellationToken) -> IngestStats {
        let mut stats = IngestStats::default();
        info!(event_type = %self.event_type, "ingest loop started");

        loop {
            let fetched = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                fetched = self.source.fetch() => fetched,
            };
            let message = match fetched {
                Ok(message) => message,
                Err(IngestError::Closed) => {
                    info!("message source closed");
                    break;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    stats.fetch_errors += 1;
                    counter!(INGEST_FETCH_ERRORS_TOTAL).increment(1);
                    warn!(error = %e, backoff_ms = duration_ms(self.retry_backoff), "fetch failed, retrying");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.retry_backoff) => continue,
                    }
                }
            };

            stats.received += 1;
            self.handle(&message, &mut stats);

            if let Err(e) = self.source.commit(&message).await {
                stats.commit_failures += 1;
                counter!(INGEST_COMMIT_ERRORS_TOTAL).increment(1);
                warn!(partition = message.partition, offset = message.offset, error = %e, "commit failed");
            }
        }

        info!(
            received = stats.received,
            published = stats.published,
            skipped_malformed = stats.skipped_malformed,
            filtered = stats.filtered,
            "ingest loop stopped"
        );
        stats
    }

    fn handle(&self, message: &QueueMessage, stats: &mut IngestStats) {
        let envelope = match Envelope::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                stats.skipped_malformed += 1;
                counter!(INGEST_MESSAGES_TOTAL, "outcome" => "malformed").increment(1);
                warn!(partition = message.partition, offset = message.offset, error = %e, "malformed message, skipping");
                return;
            }
        };

        if !envelope.is_routable(&self.event_type) {
            stats.filtered += 1;
            counter!(INGEST_MESSAGES_TOTAL, "outcome" => "filtered").increment(1);
            trace!(saga_id = %envelope.saga_id, kind = %envelope.event_type, "not routed");
            return;
        }

        let saga_id = envelope.saga_id.clone();
        match self.publisher.publish(envelope) {
            PublishOutcome::Queued => {
                stats.published += 1;
                counter!(INGEST_MESSAGES_TOTAL, "outcome" => "published").increment(1);
                trace!(%saga_id, offset = message.offset, "published");
            }
            outcome @ (PublishOutcome::Dropped | PublishOutcome::Rejected) => {
                stats.dropped += 1;
                counter!(INGEST_MESSAGES_TOTAL, "outcome" => "dropped").increment(1);
                debug!(%saga_id, ?outcome, "registry did not accept envelope");
            }
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
