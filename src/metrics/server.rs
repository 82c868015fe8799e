//! HTTP exporter for the telemetry registry
//!
//! Serves the registry over a pull-based endpoint:
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /api/snapshot` - JSON telemetry snapshot
//! - `GET /api/status` - current supervisor lifecycle state

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::Telemetry;
use crate::supervisor::SupervisorState;

/// Exporter application state
#[derive(Clone)]
pub struct ExporterState {
    pub telemetry: Arc<Telemetry>,
    pub supervisor: watch::Receiver<SupervisorState>,
}

/// Supervisor status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub state: SupervisorState,
    pub backend_running: bool,
}

/// Create the exporter router
pub fn create_router(state: ExporterState) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/api/snapshot", get(snapshot))
        .route("/api/status", get(status))
        .with_state(state)
}

async fn metrics(State(state): State<ExporterState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        state.telemetry.encode(),
    )
}

async fn snapshot(State(state): State<ExporterState>) -> impl IntoResponse {
    Json(state.telemetry.snapshot())
}

async fn status(State(state): State<ExporterState>) -> impl IntoResponse {
    let current = *state.supervisor.borrow();
    Json(StatusResponse {
        state: current,
        backend_running: state.telemetry.snapshot().backend_running,
    })
}

/// Serve the exporter until `shutdown` is cancelled.
///
/// Bind failures are returned to the caller; enforcement does not depend on
/// the exporter, so the binary only logs them.
pub async fn serve(
    addr: SocketAddr,
    state: ExporterState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "serving metrics on http://{}/metrics", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
