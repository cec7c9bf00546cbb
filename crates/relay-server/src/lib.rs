//! # relay-server
//!
//! Axum HTTP + `WebSocket` front end for the saga relay.
//!
//! - Saga registry: connections indexed by saga ID, non-blocking publish,
//!   single broadcaster task fanning out to bounded per-connection queues
//! - `WebSocket` gateway: admission (origin, saga ID), keepalive pings,
//!   write deadlines, teardown that unregisters exactly once
//! - HTTP endpoints: `/healthz`, `/stats`, `/metrics`
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{AdmissionError, ConnectionError};
pub use server::RelayServer;
pub use shutdown::{ShutdownCoordinator, wait_for_signal};
pub use websocket::connection::{Connection, ConnectionId, EnqueueOutcome, EnvelopeSink};
pub use websocket::registry::{Registry, RegistryStats};
