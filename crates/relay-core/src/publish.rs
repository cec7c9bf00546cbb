//! The capability the ingestion side needs from the fan-out side.

use crate::envelope::Envelope;

/// Result of handing an envelope to a [`Publish`] implementation.
///
/// Callers are free to ignore it; none of the variants is an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted onto the broadcast queue.
    Queued,
    /// Broadcast queue full; the envelope was discarded.
    Dropped,
    /// Not accepted at all (no saga ID, or fan-out already stopped).
    Rejected,
}

/// Fire-and-forget sink for decoded envelopes.
///
/// Implementations must never block the caller.
pub trait Publish: Send + Sync {
    /// Offer one envelope for fan-out.
    fn publish(&self, envelope: Envelope) -> PublishOutcome;
}

impl<P: Publish + ?Sized> Publish for std::sync::Arc<P> {
    fn publish(&self, envelope: Envelope) -> PublishOutcome {
        (**self).publish(envelope)
    }
}
