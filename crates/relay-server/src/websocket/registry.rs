//! Saga registry and fan-out broadcaster.
//!
//! Connections are indexed by saga ID. [`Registry::publish`] is a
//! non-blocking hand-off into a bounded queue; [`Registry::run`] drains the
//! queue and offers each envelope to every connection registered for its
//! saga. A full queue at either hop drops the envelope and counts it. Drops
//! are expected under load and never logged above `debug`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::{Mutex, RwLock};
use relay_core::{Envelope, Publish, PublishOutcome};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionId, EnqueueOutcome, EnvelopeSink};
use crate::metrics::{
    BROADCAST_DROPS_TOTAL, DELIVERY_DROPS_TOTAL, ENVELOPES_FANNED_OUT_TOTAL,
    ENVELOPES_PUBLISHED_TOTAL,
};

type SinkSet = HashMap<ConnectionId, Arc<dyn EnvelopeSink>>;

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    broadcast_drops: AtomicU64,
    rejected: AtomicU64,
    fanned_out: AtomicU64,
    delivery_drops: AtomicU64,
}

/// Point-in-time registry counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Sagas with at least one connection.
    pub sagas: usize,
    /// Registered connections across all sagas.
    pub connections: usize,
    /// Envelopes accepted into the broadcast queue.
    pub published: u64,
    /// Envelopes dropped because the broadcast queue was full.
    pub broadcast_drops: u64,
    /// Envelopes refused (no saga ID, or registry stopped).
    pub rejected: u64,
    /// Envelope copies handed to connection queues.
    pub fanned_out: u64,
    /// Envelope copies dropped at a connection queue.
    pub delivery_drops: u64,
}

/// Shared map from saga ID to the connections watching it.
pub struct Registry {
    /// Invariant: no entry maps to an empty set.
    by_saga: RwLock<HashMap<String, SinkSet>>,
    tx: mpsc::Sender<Envelope>,
    /// Taken by the first call to [`Registry::run`].
    rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    stop: CancellationToken,
    counters: Counters,
}

impl Registry {
    /// Create a registry whose broadcast queue holds `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            by_saga: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            stop: CancellationToken::new(),
            counters: Counters::default(),
        }
    }

    /// Add `sink` to the set for `saga_id`.
    ///
    /// Returns `false` when the saga ID is empty or the sink is already
    /// registered; the map is unchanged in both cases.
    pub fn register(&self, saga_id: &str, sink: Arc<dyn EnvelopeSink>) -> bool {
        if saga_id.is_empty() {
            warn!("refusing to register connection without saga id");
            return false;
        }
        let id = sink.id();
        let mut by_saga = self.by_saga.write();
        let set = by_saga.entry(saga_id.to_string()).or_default();
        if set.contains_key(&id) {
            return false;
        }
        let _ = set.insert(id, sink);
        debug!(saga_id, conn_id = %id, subscribers = set.len(), "connection registered");
        true
    }

    /// Remove the connection `id` from the set for `saga_id`.
    ///
    /// Removing the last connection removes the saga entry. Unknown sagas
    /// and connections are a no-op and return `false`.
    pub fn unregister(&self, saga_id: &str, id: ConnectionId) -> bool {
        let mut by_saga = self.by_saga.write();
        let Some(set) = by_saga.get_mut(saga_id) else {
            return false;
        };
        if set.remove(&id).is_none() {
            return false;
        }
        let remaining = set.len();
        if remaining == 0 {
            let _ = by_saga.remove(saga_id);
        }
        debug!(saga_id, conn_id = %id, remaining, "connection unregistered");
        true
    }

    /// Hand `envelope` to the broadcaster without blocking.
    pub fn publish(&self, envelope: Envelope) -> PublishOutcome {
        if !envelope.has_saga_id() || self.stop.is_cancelled() {
            let _ = self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            trace!(stopped = self.stop.is_cancelled(), "publish rejected");
            return PublishOutcome::Rejected;
        }
        match self.tx.try_send(envelope) {
            Ok(()) => {
                let _ = self.counters.published.fetch_add(1, Ordering::Relaxed);
                counter!(ENVELOPES_PUBLISHED_TOTAL).increment(1);
                PublishOutcome::Queued
            }
            Err(TrySendError::Full(envelope)) => {
                let _ = self.counters.broadcast_drops.fetch_add(1, Ordering::Relaxed);
                counter!(BROADCAST_DROPS_TOTAL).increment(1);
                debug!(saga_id = %envelope.saga_id, "broadcast queue full, dropping envelope");
                PublishOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                let _ = self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                PublishOutcome::Rejected
            }
        }
    }

    /// Drain the broadcast queue until [`Registry::stop`] is called.
    ///
    /// Only the first caller runs; later calls return immediately.
    pub async fn run(&self) {
        let taken = self.rx.lock().take();
        let Some(mut rx) = taken else {
            warn!("broadcaster already running");
            return;
        };
        info!("broadcaster started");
        loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                next = rx.recv() => match next {
                    Some(envelope) => self.fan_out(envelope),
                    None => break,
                },
            }
        }
        info!(
            published = self.counters.published.load(Ordering::Relaxed),
            broadcast_drops = self.counters.broadcast_drops.load(Ordering::Relaxed),
            "broadcaster stopped"
        );
    }

    /// Run the broadcaster on a new task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.run().await })
    }

    /// Stop the broadcaster. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("stopping broadcaster");
        }
        self.stop.cancel();
    }

    /// Whether [`Registry::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn fan_out(&self, envelope: Envelope) {
        let envelope = Arc::new(envelope);
        let (delivered, dropped) = {
            let by_saga = self.by_saga.read();
            let Some(set) = by_saga.get(&envelope.saga_id) else {
                trace!(saga_id = %envelope.saga_id, "no subscribers");
                return;
            };
            let mut delivered = 0u64;
            let mut dropped = 0u64;
            for sink in set.values() {
                match sink.enqueue(Arc::clone(&envelope)) {
                    EnqueueOutcome::Queued => delivered += 1,
                    EnqueueOutcome::Dropped | EnqueueOutcome::Closed => dropped += 1,
                }
            }
            (delivered, dropped)
        };
        let _ = self.counters.fanned_out.fetch_add(delivered, Ordering::Relaxed);
        counter!(ENVELOPES_FANNED_OUT_TOTAL).increment(delivered);
        if dropped > 0 {
            let _ = self.counters.delivery_drops.fetch_add(dropped, Ordering::Relaxed);
            counter!(DELIVERY_DROPS_TOTAL).increment(dropped);
        }
        debug!(saga_id = %envelope.saga_id, recipients = delivered, dropped, "fanned out envelope");
    }

    /// Connections registered for `saga_id`.
    pub fn subscriber_count(&self, saga_id: &str) -> usize {
        self.by_saga.read().get(saga_id).map_or(0, HashMap::len)
    }

    /// Sagas with at least one connection.
    pub fn saga_count(&self) -> usize {
        self.by_saga.read().len()
    }

    /// Registered connections across all sagas.
    pub fn connection_count(&self) -> usize {
        self.by_saga.read().values().map(HashMap::len).sum()
    }

    /// Snapshot of counters and sizes.
    pub fn stats(&self) -> RegistryStats {
        let (sagas, connections) = {
            let by_saga = self.by_saga.read();
            (by_saga.len(), by_saga.values().map(HashMap::len).sum())
        };
        RegistryStats {
            sagas,
            connections,
            published: self.counters.published.load(Ordering::Relaxed),
            broadcast_drops: self.counters.broadcast_drops.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            fanned_out: self.counters.fanned_out.load(Ordering::Relaxed),
            delivery_drops: self.counters.delivery_drops.load(Ordering::Relaxed),
        }
    }
}

impl Publish for Registry {
    fn publish(&self, envelope: Envelope) -> PublishOutcome {
        Registry::publish(self, envelope)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("stats", &self.stats())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
