//! # relay-core
//!
//! Foundation types for the saga relay.
//!
//! - [`Envelope`]: the decoded notification and its stable wire shape
//! - [`Publish`]: the non-blocking hand-off from ingestion to fan-out
//! - [`logging`]: subscriber initialisation and test capture

#![deny(unsafe_code)]

pub mod envelope;
pub mod logging;
pub mod publish;

pub use envelope::{Envelope, STATE_CHANGED_EVENT};
pub use publish::{Publish, PublishOutcome};
