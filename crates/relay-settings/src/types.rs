//! Settings type definitions.
//!
//! Field names are snake_case to match the TOML file. Every section is
//! `#[serde(default)]`, so a partial file only overrides what it names.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the relay process.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// HTTP listener and admission policy.
    pub http: HttpSettings,
    /// Queue consumer.
    pub kafka: KafkaSettings,
    /// Per-connection WebSocket behaviour.
    pub ws: WsSettings,
    /// Fan-out queue sizing.
    pub registry: RegistrySettings,
    /// Authentication switches.
    pub security: SecuritySettings,
    /// Shutdown behaviour.
    pub shutdown: ShutdownSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// HTTP listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Bind address, `host:port`.
    pub addr: String,
    /// Allowed `Origin` values. Empty means unrestricted.
    pub allowed_origins: Vec<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Kafka consumer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaSettings {
    /// Bootstrap brokers.
    pub brokers: Vec<String>,
    /// Consumer group. Empty reads the whole topic from the beginning
    /// without committing offsets.
    pub group_id: String,
    /// Topic carrying saga events.
    pub topic: String,
    /// Event kind forwarded to clients.
    pub event_type: String,
    /// Delay before retrying a failed fetch, in milliseconds.
    pub retry_backoff_ms: u64,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "saga-relay".to_string(),
            topic: "saga.events".to_string(),
            event_type: "saga.orchestrator.state.changed".to_string(),
            retry_backoff_ms: 500,
        }
    }
}

impl KafkaSettings {
    /// Fetch retry delay.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// WebSocket connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSettings {
    /// Keepalive ping interval in seconds.
    pub ping_interval_sec: u64,
    /// Deadline for a single outbound frame, in seconds.
    pub write_timeout_sec: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_bytes: usize,
    /// Outbound envelopes buffered per connection before dropping.
    pub send_queue_capacity: usize,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            ping_interval_sec: 30,
            write_timeout_sec: 10,
            max_message_bytes: 64 * 1024,
            send_queue_capacity: 128,
        }
    }
}

impl WsSettings {
    /// Keepalive ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_sec)
    }

    /// Per-frame write deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_sec)
    }
}

/// Registry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Envelopes buffered ahead of the broadcaster before dropping.
    pub broadcast_capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
        }
    }
}

/// Security settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Advisory only; no authentication is performed.
    pub require_auth: bool,
}

/// Shutdown settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// Time allowed for the server, ingestion and open connections to drain.
    pub grace_period_sec: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { grace_period_sec: 5 }
    }
}

impl ShutdownSettings {
    /// Drain deadline.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_sec)
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl RelaySettings {
    /// Check values that deserialize fine but cannot run.
    ///
    /// Kafka settings are checked separately by [`Self::validate_kafka`]
    /// because the relay can run without a consumer.
    pub fn validate(&self) -> Result<()> {
        let _ = self.bind_addr()?;
        if self.ws.ping_interval_sec == 0 {
            return Err(invalid("ws.ping_interval_sec must be greater than zero"));
        }
        if self.ws.write_timeout_sec == 0 {
            return Err(invalid("ws.write_timeout_sec must be greater than zero"));
        }
        if self.ws.max_message_bytes == 0 {
            return Err(invalid("ws.max_message_bytes must be greater than zero"));
        }
        if self.ws.send_queue_capacity == 0 {
            return Err(invalid("ws.send_queue_capacity must be greater than zero"));
        }
        if self.registry.broadcast_capacity == 0 {
            return Err(invalid(
                "registry.broadcast_capacity must be greater than zero",
            ));
        }
        if !matches!(self.logging.format.as_str(), "compact" | "text" | "json") {
            return Err(SettingsError::InvalidValue(format!(
                "logging.format must be 'compact' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Check the consumer settings.
    pub fn validate_kafka(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(invalid("kafka.brokers must name at least one broker"));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(invalid("kafka.topic must not be empty"));
        }
        if self.kafka.event_type.trim().is_empty() {
            return Err(invalid("kafka.event_type must not be empty"));
        }
        Ok(())
    }

    /// Parsed HTTP bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.http.addr.parse().map_err(|e| {
            SettingsError::InvalidValue(format!("http.addr '{}': {e}", self.http.addr))
        })
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}
