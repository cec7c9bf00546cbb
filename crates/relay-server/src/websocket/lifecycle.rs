//! Per-connection read and write loops and teardown.
//!
//! The loops are generic over `futures` sinks and streams so they run the
//! same against an upgraded axum socket and an in-memory channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, close_code};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::Envelope;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionId, ConnectionState};
use super::registry::Registry;
use crate::errors::ConnectionError;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_WRITE_TIMEOUTS_TOTAL,
};

/// Timing and sizing for one connection.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Outbound envelopes buffered before dropping.
    pub send_queue_capacity: usize,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Deadline for a single outbound frame.
    pub write_timeout: Duration,
    /// Time the writer gets to flush after shutdown begins.
    pub grace_period: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            send_queue_capacity: 128,
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// How the write loop ended.
#[derive(Debug)]
pub enum WriteExit {
    /// Shutdown: pending envelopes flushed and close frame sent.
    Drained,
    /// The read side ended; a close frame was attempted.
    HungUp,
    /// The outbound queue closed.
    QueueClosed,
    /// A write failed or timed out.
    Failed(ConnectionError),
}

/// How the read loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadExit {
    /// The client sent a close frame.
    Closed,
    /// The stream ended without a close frame.
    Eof,
    /// The transport reported an error.
    Error(String),
}

/// Why a connection was torn down.
#[derive(Debug)]
pub enum TeardownReason {
    /// Read loop ended.
    Read(ReadExit),
    /// Write loop ended first.
    Write(WriteExit),
    /// Process shutdown.
    Shutdown,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(ReadExit::Closed) => f.write_str("client closed"),
            Self::Read(ReadExit::Eof) => f.write_str("client went away"),
            Self::Read(ReadExit::Error(e)) => write!(f, "read error: {e}"),
            Self::Write(WriteExit::Failed(e)) => write!(f, "write failed: {e}"),
            Self::Write(exit) => write!(f, "writer exited: {exit:?}"),
            Self::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Summary of a finished connection.
#[derive(Debug)]
pub struct ConnectionSummary {
    /// Connection identity.
    pub id: ConnectionId,
    /// Saga the connection watched.
    pub saga_id: String,
    /// What ended it.
    pub reason: TeardownReason,
    /// Envelopes dropped on a full queue.
    pub dropped: u64,
    /// Connection lifetime.
    pub lifetime: Duration,
}

/// Drain the outbound queue onto `sink` with keepalive pings.
///
/// Every frame is bounded by `opts.write_timeout`. `hangup` abandons the
/// queue and sends a normal close frame. `shutdown` flushes what is already
/// queued, then sends a normal close frame.
///
/// After a client close, the transport refuses a second close frame but
/// flushes its queued reply when the sink is closed, which completes the
/// handshake.
pub async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<Envelope>>,
    conn_id: ConnectionId,
    opts: ConnectionOptions,
    shutdown: CancellationToken,
    hangup: CancellationToken,
) -> WriteExit
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    // First tick one full interval from now.
    let mut keepalive = time::interval_at(Instant::now() + opts.ping_interval, opts.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = hangup.cancelled() => {
                send_close(&mut sink, opts.write_timeout, conn_id).await;
                return WriteExit::HungUp;
            }
            () = shutdown.cancelled() => {
                rx.close();
                while let Some(envelope) = rx.recv().await {
                    if let Err(e) = send_envelope(&mut sink, &envelope, opts.write_timeout).await {
                        return WriteExit::Failed(e);
                    }
                }
                send_close(&mut sink, opts.write_timeout, conn_id).await;
                return WriteExit::Drained;
            }
            next = rx.recv() => match next {
                Some(envelope) => {
                    if let Err(e) = send_envelope(&mut sink, &envelope, opts.write_timeout).await {
                        return WriteExit::Failed(e);
                    }
                }
                None => {
                    send_close(&mut sink, opts.write_timeout, conn_id).await;
                    return WriteExit::QueueClosed;
                }
            },
            _ = keepalive.tick() => {
                if let Err(e) = send_frame(&mut sink, Message::Ping(Bytes::new()), opts.write_timeout).await {
                    return WriteExit::Failed(e);
                }
            }
        }
    }
}

/// Consume inbound frames until close, error, or end of stream.
///
/// Inbound content is ignored; the loop exists to detect disconnects.
/// Pong replies to inbound pings are handled by the transport.
pub async fn read_loop<St, E>(mut stream: St, conn_id: ConnectionId) -> ReadExit
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(frame)) => {
                debug!(conn_id = %conn_id, code = frame.as_ref().map(|f| f.code), "client sent close");
                return ReadExit::Closed;
            }
            Ok(_) => {}
            Err(e) => return ReadExit::Error(e.to_string()),
        }
    }
    ReadExit::Eof
}

/// Run one connection from registration to teardown.
///
/// The connection is registered before either loop starts and unregistered
/// exactly once, whichever side ends first.
pub async fn serve_connection<S, St, E>(
    sink: S,
    stream: St,
    saga_id: String,
    registry: Arc<Registry>,
    opts: ConnectionOptions,
    shutdown: CancellationToken,
) -> ConnectionSummary
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let (conn, rx) = Connection::new(saga_id, opts.send_queue_capacity);
    let conn_id = conn.id();
    let _ = registry.register(conn.saga_id(), conn.clone());
    conn.advance(ConnectionState::Registered);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(conn_id = %conn_id, saga_id = conn.saga_id(), "connection opened");

    let hangup = CancellationToken::new();
    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        conn_id,
        opts.clone(),
        shutdown.clone(),
        hangup.clone(),
    ));
    conn.advance(ConnectionState::Active);

    let reason = tokio::select! {
        biased;
        () = shutdown.cancelled() => TeardownReason::Shutdown,
        exit = read_loop(stream, conn_id) => TeardownReason::Read(exit),
        joined = &mut writer => TeardownReason::Write(joined.unwrap_or_else(|e| {
            WriteExit::Failed(ConnectionError::Transport(Box::new(e)))
        })),
    };

    conn.advance(ConnectionState::Unregistering);
    let _ = registry.unregister(conn.saga_id(), conn_id);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);

    let reason = match reason {
        TeardownReason::Write(exit) => TeardownReason::Write(exit),
        other => {
            if !matches!(other, TeardownReason::Shutdown) {
                hangup.cancel();
            }
            match time::timeout(opts.grace_period, &mut writer).await {
                Ok(Ok(WriteExit::Failed(e))) => {
                    debug!(conn_id = %conn_id, error = %e, "writer failed during teardown");
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(conn_id = %conn_id, "writer did not finish within grace period, aborting");
                    writer.abort();
                }
            }
            other
        }
    };

    if let TeardownReason::Write(WriteExit::Failed(ConnectionError::WriteTimeout(_))) = &reason {
        counter!(WS_WRITE_TIMEOUTS_TOTAL).increment(1);
    }
    conn.advance(ConnectionState::Closed);
    let lifetime = conn.age();
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(lifetime.as_secs_f64());
    info!(
        conn_id = %conn_id,
        saga_id = conn.saga_id(),
        reason = %reason,
        dropped = conn.drop_count(),
        lifetime_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX),
        "connection closed"
    );

    ConnectionSummary {
        id: conn_id,
        saga_id: conn.saga_id().to_string(),
        reason,
        dropped: conn.drop_count(),
        lifetime,
    }
}

async fn send_envelope<S>(
    sink: &mut S,
    envelope: &Envelope,
    deadline: Duration,
) -> Result<(), ConnectionError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(e) => {
            warn!(saga_id = %envelope.saga_id, error = %e, "failed to encode envelope, skipping");
            return Ok(());
        }
    };
    send_frame(sink, Message::Text(Utf8Bytes::from(text)), deadline).await
}

async fn send_frame<S>(sink: &mut S, frame: Message, deadline: Duration) -> Result<(), ConnectionError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match time::timeout(deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Transport(Box::new(e))),
        Err(_) => Err(ConnectionError::WriteTimeout(deadline)),
    }
}

async fn send_close<S>(sink: &mut S, deadline: Duration, conn_id: ConnectionId)
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Utf8Bytes::from_static("bye"),
    }));
    if let Err(e) = send_frame(sink, frame, deadline).await {
        debug!(conn_id = %conn_id, error = %e, "close frame not delivered");
    }
    // Flushes the transport's own close reply when the peer closed first.
    match time::timeout(deadline, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(conn_id = %conn_id, error = %e, "close handshake not flushed"),
        Err(_) => debug!(conn_id = %conn_id, "close handshake timed out"),
    }
}
