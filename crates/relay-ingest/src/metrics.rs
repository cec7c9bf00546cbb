//! Ingestion metric names.

/// Messages received (counter, labels: outcome).
pub const INGEST_MESSAGES_TOTAL: &str = "relay_ingest_messages_total";
/// Failed fetches (counter).
pub const INGEST_FETCH_ERRORS_TOTAL: &str = "relay_ingest_fetch_errors_total";
/// Failed commits (counter).
pub const INGEST_COMMIT_ERRORS_TOTAL: &str = "relay_ingest_commit_errors_total";
