//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::errors::AdmissionError;
use crate::health::{self, LIVENESS_BODY, StatsResponse};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::lifecycle::serve_connection;
use crate::websocket::origin::OriginPolicy;
use crate::websocket::registry::Registry;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Saga registry and broadcaster.
    pub registry: Arc<Registry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// `Origin` allow-list.
    pub origins: Arc<OriginPolicy>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Tracks upgraded connection tasks.
    pub connections: TaskTracker,
    /// When the server started.
    pub start_time: Instant,
}

/// Upgrade query parameters.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WsParams {
    /// Saga to subscribe to.
    pub saga_id: Option<String>,
}

impl WsParams {
    /// Pick parameters out of decoded query pairs. The first `saga_id` wins.
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let saga_id = pairs
            .into_iter()
            .find_map(|(key, value)| (key == "saga_id").then_some(value));
        Self { saga_id }
    }
}

/// The relay's HTTP and WebSocket front end.
pub struct RelayServer {
    state: AppState,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a server over an existing registry.
    pub fn new(config: ServerConfig, registry: Arc<Registry>) -> Self {
        if config.require_auth {
            warn!("security.require_auth is set but no authentication is performed");
        }
        let origins = OriginPolicy::new(config.allowed_origins.iter().cloned());
        Self {
            state: AppState {
                registry,
                config: Arc::new(config),
                origins: Arc::new(origins),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                connections: TaskTracker::new(),
                start_time: Instant::now(),
            },
            metrics: None,
        }
    }

    /// Expose `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(healthz_handler))
            .route("/stats", get(stats_handler));
        if let Some(handle) = self.metrics.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serve task. The listener stops
    /// accepting when the shutdown token is cancelled; upgraded connections
    /// drain separately through [`Self::drain_connections`].
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.token();
        info!(%addr, "relay listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "http server error");
            }
            info!("http server stopped");
        });
        Ok((addr, handle))
    }

    /// Wait up to `timeout` for every open connection to finish.
    ///
    /// Call after shutdown has begun. Returns `false` on timeout.
    pub async fn drain_connections(&self, timeout: Duration) -> bool {
        let tracker = &self.state.connections;
        let _ = tracker.close();
        info!(open = tracker.len(), "draining connections");
        tokio::time::timeout(timeout, tracker.wait()).await.is_ok()
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.state.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Connection tasks still running.
    pub fn open_connections(&self) -> usize {
        self.state.connections.len()
    }
}

/// GET /ws?saga_id=...
///
/// Admission runs before the handshake: origin first, then saga ID. The
/// query is parsed here rather than by the extractor so a malformed query
/// never pre-empts the origin check; it counts as a missing saga ID.
async fn ws_handler(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    if !state.origins.allows(headers.get(header::ORIGIN)) {
        debug!(origin = ?headers.get(header::ORIGIN), "origin not allowed");
        return reject(AdmissionError::ForbiddenOrigin);
    }
    let params = query.map_or_else(|_| WsParams::default(), |Query(pairs)| WsParams::from_pairs(pairs));
    let Some(saga_id) = params.saga_id.filter(|s| !s.is_empty()) else {
        return reject(AdmissionError::MissingSagaId);
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = Arc::clone(&state.registry);
    let opts = state.config.connection_options();
    let token = state.shutdown.token();
    let tracker = state.connections.clone();
    upgrade
        .max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| {
            tracker.track_future(async move {
                let (sink, stream) = socket.split();
                let _summary = serve_connection(sink, stream, saga_id, registry, opts, token).await;
            })
        })
}

fn reject(err: AdmissionError) -> Response {
    counter!(WS_REJECTED_TOTAL, "reason" => err.reason()).increment(1);
    err.into_response()
}

/// GET /healthz
async fn healthz_handler() -> &'static str {
    LIVENESS_BODY
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(health::stats(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.registry.stats(),
    ))
}
