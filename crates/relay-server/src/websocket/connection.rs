//! WebSocket client connection state.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use relay_core::Envelope;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Process-unique connection identity.
///
/// Two connections on the same saga are never equal, whatever their
/// contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identity.
    pub fn next() -> Self {
        static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// Result of offering an envelope to a connection's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Buffered for the write loop.
    Queued,
    /// Queue at capacity; the envelope was discarded.
    Dropped,
    /// The write loop is gone; the envelope was discarded.
    Closed,
}

/// The only thing the registry needs from a subscriber.
///
/// `enqueue` must return immediately. Delivery is asynchronous and may
/// silently drop.
pub trait EnvelopeSink: Send + Sync {
    /// Identity used as the set-membership key.
    fn id(&self) -> ConnectionId;

    /// Offer one envelope for asynchronous delivery.
    fn enqueue(&self, envelope: Arc<Envelope>) -> EnqueueOutcome;
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake done, saga ID validated.
    Accepted = 0,
    /// Present in the registry.
    Registered = 1,
    /// Read and write loops running.
    Active = 2,
    /// Teardown started; being removed from the registry.
    Unregistering = 3,
    /// Removed and transport released.
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Accepted,
            1 => Self::Registered,
            2 => Self::Active,
            3 => Self::Unregistering,
            _ => Self::Closed,
        }
    }
}

/// One client subscribed to one saga for its whole lifetime.
pub struct Connection {
    id: ConnectionId,
    saga_id: String,
    /// Producer side of the outbound queue. The write loop owns the receiver.
    tx: mpsc::Sender<Arc<Envelope>>,
    state: AtomicU8,
    /// Envelopes discarded because the queue was full.
    dropped: AtomicU64,
    connected_at: Instant,
}

impl Connection {
    /// Create a connection with an outbound queue of `capacity` envelopes.
    ///
    /// Returns the receiver the write loop drains.
    pub fn new(
        saga_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            saga_id: saga_id.into(),
            tx,
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        });
        (conn, rx)
    }

    /// Connection identity.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The saga this connection watches.
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next`. Backward transitions are ignored.
    pub(crate) fn advance(&self, next: ConnectionState) {
        let prev = ConnectionState::from_u8(self.state.fetch_max(next as u8, Ordering::AcqRel));
        if prev < next {
            debug!(conn_id = %self.id, saga_id = %self.saga_id, from = ?prev, to = ?next, "connection state");
        }
    }

    /// Envelopes dropped on a full queue so far.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Envelopes currently waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl EnvelopeSink for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn enqueue(&self, envelope: Arc<Envelope>) -> EnqueueOutcome {
        match self.tx.try_send(envelope) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let drops = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(conn_id = %self.id, saga_id = %self.saga_id, drops, "outbound queue full, dropping envelope");
                EnqueueOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("saga_id", &self.saga_id)
            .field("state", &self.state())
            .field("dropped", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(step: u64) -> Arc<Envelope> {
        Arc::new(Envelope::new(
            "saga_1",
            relay_core::STATE_CHANGED_EVENT,
            json!({ "step": step }),
        ))
    }

    #[test]
    fn ids_are_unique() {
        let (a, _rx_a) = Connection::new("saga_1", 4);
        let (b, _rx_b) = Connection::new("saga_1", 4);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("conn_"));
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = Connection::new("saga_1", 4);
        assert_eq!(conn.saga_id(), "saga_1");
        assert_eq!(conn.state(), ConnectionState::Accepted);
        assert_eq!(conn.drop_count(), 0);
        assert_eq!(conn.queued(), 0);
    }

    #[tokio::test]
    async fn enqueue_delivers_in_order() {
        let (conn, mut rx) = Connection::new("saga_1", 8);
        for step in 0..5 {
            assert_eq!(conn.enqueue(envelope(step)), EnqueueOutcome::Queued);
        }
        for step in 0..5 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.payload["step"], step);
        }
    }

    #[test]
    fn full_queue_drops_without_growing() {
        let (conn, _rx) = Connection::new("saga_1", 2);
        assert_eq!(conn.enqueue(envelope(1)), EnqueueOutcome::Queued);
        assert_eq!(conn.enqueue(envelope(2)), EnqueueOutcome::Queued);
        for step in 3..10 {
            assert_eq!(conn.enqueue(envelope(step)), EnqueueOutcome::Dropped);
        }
        assert_eq!(conn.queued(), 2);
        assert_eq!(conn.drop_count(), 7);
    }

    #[tokio::test]
    async fn full_queue_keeps_oldest() {
        let (conn, mut rx) = Connection::new("saga_1", 1);
        let _ = conn.enqueue(envelope(1));
        let _ = conn.enqueue(envelope(2));
        assert_eq!(rx.recv().await.unwrap().payload["step"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn enqueue_after_teardown_is_closed() {
        let (conn, rx) = Connection::new("saga_1", 4);
        drop(rx);
        assert_eq!(conn.enqueue(envelope(1)), EnqueueOutcome::Closed);
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (conn, _rx) = Connection::new("saga_1", 0);
        assert_eq!(conn.enqueue(envelope(1)), EnqueueOutcome::Queued);
        assert_eq!(conn.enqueue(envelope(2)), EnqueueOutcome::Dropped);
    }

    #[test]
    fn state_only_moves_forward() {
        let (conn, _rx) = Connection::new("saga_1", 1);
        conn.advance(ConnectionState::Registered);
        conn.advance(ConnectionState::Active);
        assert_eq!(conn.state(), ConnectionState::Active);
        conn.advance(ConnectionState::Registered);
        assert_eq!(conn.state(), ConnectionState::Active);
        conn.advance(ConnectionState::Closed);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn debug_includes_identity() {
        let (conn, _rx) = Connection::new("saga_dbg", 1);
        let s = format!("{conn:?}");
        assert!(s.contains("saga_dbg"));
        assert!(s.contains("Accepted"));
    }
}
