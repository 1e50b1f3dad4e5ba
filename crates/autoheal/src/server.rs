//! HTTP server.
//!
//! Endpoints:
//! - `POST /alerts`: Alertmanager webhook, queues every alert of the payload
//! - `GET /metrics`: Prometheus metrics
//! - `GET /health`: liveness

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertmanagerPayload};
use crate::metrics::PrometheusMetrics;
use crate::queue::WorkQueue;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9099";

/// Server state shared across handlers.
pub struct ServerState {
    /// Queue consumed by the alerts worker
    pub alerts: WorkQueue<Alert>,
    pub metrics: Arc<PrometheusMetrics>,
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/alerts", post(alerts_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires, then finish the in-flight requests.
pub async fn run_server(
    state: Arc<ServerState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!(%addr, "Autoheal server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("Autoheal server stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct AlertsResponse {
    status: &'static str,
    alerts: usize,
}

async fn alerts_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<AlertmanagerPayload>,
) -> impl IntoResponse {
    let count = payload.alerts.len();
    info!(
        alerts = count,
        status = %payload.status,
        receiver = %payload.receiver,
        "Received alert webhook"
    );

    let mut queued = 0;
    for alert in payload.alerts {
        debug!(alert = %alert.name(), status = %alert.status, "Queuing alert");
        if state.alerts.add(alert) {
            queued += 1;
        }
    }

    if queued < count {
        warn!(dropped = count - queued, "Alerts queue is shut down, alerts were dropped");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(AlertsResponse {
                status: "unavailable",
                alerts: queued,
            }),
        );
    }

    (
        StatusCode::OK,
        Json(AlertsResponse {
            status: "ok",
            alerts: queued,
        }),
    )
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
