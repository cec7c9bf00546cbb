//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use relay_settings::RelaySettings;

use crate::websocket::lifecycle::ConnectionOptions;

/// Configuration for the relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address (default `127.0.0.1:0`, auto-assigned port).
    pub bind_addr: SocketAddr,
    /// Allowed `Origin` values. Empty allows all.
    pub allowed_origins: Vec<String>,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
    /// Deadline for a single outbound frame.
    pub write_timeout: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_bytes: usize,
    /// Outbound envelopes buffered per connection.
    pub send_queue_capacity: usize,
    /// Advisory authentication switch. Logged, not enforced.
    pub require_auth: bool,
    /// Drain deadline on shutdown.
    pub grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            allowed_origins: Vec::new(),
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 64 * 1024,
            send_queue_capacity: 128,
            require_auth: false,
            grace_period: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Derive server configuration from loaded settings.
    pub fn from_settings(settings: &RelaySettings) -> relay_settings::Result<Self> {
        Ok(Self {
            bind_addr: settings.bind_addr()?,
            allowed_origins: settings.http.allowed_origins.clone(),
            ping_interval: settings.ws.ping_interval(),
            write_timeout: settings.ws.write_timeout(),
            max_message_bytes: settings.ws.max_message_bytes,
            send_queue_capacity: settings.ws.send_queue_capacity,
            require_auth: settings.security.require_auth,
            grace_period: settings.shutdown.grace_period(),
        })
    }

    /// Per-connection timing and sizing.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            send_queue_capacity: self.send_queue_capacity,
            ping_interval: self.ping_interval,
            write_timeout: self.write_timeout,
            grace_period: self.grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_loopback_ephemeral() {
        let cfg = ServerConfig::default();
        assert!(cfg.bind_addr.ip().is_loopback());
        assert_eq!(cfg.bind_addr.port(), 0);
    }

    #[test]
    fn from_default_settings() {
        let cfg = ServerConfig::from_settings(&RelaySettings::default()).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.write_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_message_bytes, 65536);
        assert!(!cfg.require_auth);
    }

    #[test]
    fn from_settings_rejects_bad_addr() {
        let mut settings = RelaySettings::default();
        settings.http.addr = "nowhere".into();
        assert!(ServerConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn connection_options_follow_config() {
        let cfg = ServerConfig {
            send_queue_capacity: 7,
            write_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        };
        let opts = cfg.connection_options();
        assert_eq!(opts.send_queue_capacity, 7);
        assert_eq!(opts.write_timeout, Duration::from_secs(2));
        assert_eq!(opts.ping_interval, cfg.ping_interval);
    }
}
