//! Saga state-change envelope.
//!
//! The serialized shape of [`Envelope`] is the relay's public contract with
//! UI consumers: `message_id?`, `trace_id?`, `saga_id`, `type`, `payload`,
//! `meta?`. Adding, renaming, or reordering fields breaks clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The one event kind routed to clients by default.
pub const STATE_CHANGED_EVENT: &str = "saga.orchestrator.state.changed";

/// One workflow state transition, decoded from a queue message.
///
/// Immutable once constructed. The broadcaster shares it between
/// connections behind an `Arc`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Producer-assigned message ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Distributed trace ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Saga (workflow) ID; the routing key.
    #[serde(default)]
    pub saga_id: String,
    /// Event kind, e.g. [`STATE_CHANGED_EVENT`].
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Saga state, passed through verbatim.
    #[serde(default)]
    pub payload: Value,
    /// Free-form producer metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

impl Envelope {
    /// Build an envelope with only the required fields set.
    pub fn new(saga_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: None,
            trace_id: None,
            saga_id: saga_id.into(),
            event_type: event_type.into(),
            payload,
            meta: None,
        }
    }

    /// Attach a message ID.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Attach a trace ID.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Decode a raw queue message.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Whether this envelope has a routing key at all.
    pub fn has_saga_id(&self) -> bool {
        !self.saga_id.is_empty()
    }

    /// Whether this envelope should be handed to the registry when the relay
    /// routes events of kind `routed_kind`.
    pub fn is_routable(&self, routed_kind: &str) -> bool {
        self.has_saga_id() && self.event_type == routed_kind
    }
}
