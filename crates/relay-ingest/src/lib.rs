//! # relay-ingest
//!
//! Feeds saga events from a message queue into the relay.
//!
//! [`IngestLoop`] reads a [`MessageSource`], decodes each record as an
//! [`Envelope`](relay_core::Envelope), publishes the routable ones through
//! [`Publish`](relay_core::Publish), and commits every record it handled.
//! [`KafkaSource`] is the production source (feature `kafka`).

#![deny(unsafe_code)]

pub mod error;
pub mod ingest;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod metrics;
pub mod source;

pub use error::IngestError;
pub use ingest::{IngestLoop, IngestStats};
#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;
pub use source::{MessageSource, QueueMessage};
