//! Liveness and stats endpoints.

use std::time::Instant;

use serde::Serialize;

use crate::websocket::registry::RegistryStats;

/// Fixed liveness body.
pub const LIVENESS_BODY: &str = "OK";

/// `/stats` response body.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Whether shutdown has begun.
    pub shutting_down: bool,
    /// Registry counters.
    #[serde(flatten)]
    pub registry: RegistryStats,
}

/// Build a stats response from live counters.
pub fn stats(start_time: Instant, shutting_down: bool, registry: RegistryStats) -> StatsResponse {
    StatsResponse {
        uptime_secs: start_time.elapsed().as_secs(),
        shutting_down,
        registry,
    }
}
