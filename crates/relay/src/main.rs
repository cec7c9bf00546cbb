//! # relay
//!
//! Saga relay binary: consumes saga state changes from the queue and fans
//! them out to WebSocket clients subscribed by saga ID.

#![deny(unsafe_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::logging::{LogFormat, init_subscriber};
use relay_settings::RelaySettings;
use relay_server::{Registry, RelayServer, ServerConfig, wait_for_signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Saga relay server.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Relay saga state changes to WebSocket clients")]
struct Cli {
    /// Settings file (default `relay.toml`; missing is fine).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address, overrides `http.addr`.
    #[arg(long)]
    addr: Option<String>,

    /// Run without the queue consumer.
    #[arg(long)]
    no_ingest: bool,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut RelaySettings) {
        if let Some(addr) = &self.addr {
            settings.http.addr.clone_from(addr);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = relay_settings::load_settings_with(args.config.as_deref(), |s| {
        args.apply_overrides(s);
    })
    .context("Failed to load settings")?;
    let ingest = !args.no_ingest;
    if ingest {
        settings
            .validate_kafka()
            .context("Invalid kafka settings")?;
    }

    let format: LogFormat = settings
        .logging
        .format
        .parse()
        .map_err(anyhow::Error::msg)?;
    init_subscriber(&settings.logging.level, format);

    let metrics = relay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    run(settings, ingest, Some(metrics), wait_for_signal()).await
}

/// Start everything, wait for `signal`, then shut down in order.
async fn run(
    settings: RelaySettings,
    ingest: bool,
    metrics: Option<PrometheusHandle>,
    signal: impl Future<Output = ()>,
) -> Result<()> {
    let registry = Arc::new(Registry::new(settings.registry.broadcast_capacity));
    let broadcaster = registry.spawn();

    let config = ServerConfig::from_settings(&settings).context("Invalid server settings")?;
    let mut server = RelayServer::new(config, Arc::clone(&registry));
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }
    let shutdown = server.shutdown().token();

    let consumer = if ingest {
        Some(spawn_ingest(&settings, &registry, shutdown.clone())?)
    } else {
        info!("ingestion disabled");
        None
    };

    let (addr, serve) = server.listen().await.context("Failed to bind server")?;
    info!(%addr, ingest, "relay ready");

    signal.await;
    info!("shutting down");

    let grace = settings.shutdown.grace_period();
    server.shutdown().shutdown();
    registry.stop();

    let mut handles = vec![serve, broadcaster];
    handles.extend(consumer);
    let (tasks_done, connections_done) = tokio::join!(
        server.shutdown().graceful_shutdown(handles, grace),
        server.drain_connections(grace),
    );
    if !(tasks_done && connections_done) {
        warn!(
            open_connections = server.open_connections(),
            "grace period elapsed before everything stopped"
        );
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "kafka")]
fn spawn_ingest(
    settings: &RelaySettings,
    registry: &Arc<Registry>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    use relay_ingest::{IngestLoop, KafkaSource};

    let source = KafkaSource::new(&settings.kafka).context("Failed to create kafka consumer")?;
    let publisher: Arc<dyn relay_core::Publish> = Arc::clone(registry) as _;
    let ingest = IngestLoop::new(source, publisher)
        .with_event_type(settings.kafka.event_type.clone())
        .with_retry_backoff(settings.kafka.retry_backoff());
    Ok(tokio::spawn(async move {
        let stats = ingest.run(cancel).await;
        info!(?stats, "ingestion finished");
    }))
}

#[cfg(not(feature = "kafka"))]
fn spawn_ingest(
    _settings: &RelaySettings,
    _registry: &Arc<Registry>,
    _cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    anyhow::bail!("built without the kafka feature; run with --no-ingest")
}
