//! Observer status endpoints
//!
//! `/healthz` reports the resolver, provider and reporter components,
//! `/readyz` turns ready after the first completed monitoring cycle and
//! `/metrics` exposes the observer's Prometheus registry.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use observer_lib::{health::HealthRegistry, observability::ObserverMetrics};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

/// State shared by the status handlers
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: ObserverMetrics,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry, metrics: ObserverMetrics) -> Self {
        Self {
            health_registry,
            metrics,
        }
    }
}

fn status_for(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Component health of the observer. A directory outage only degrades the
/// resolver and keeps 200; lost process access makes the provider
/// unhealthy and turns this into 503.
async fn component_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    (status_for(health.status.is_operational()), Json(health))
}

/// Ready once a monitoring cycle has finished and no component is unhealthy
async fn cycle_readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    (status_for(readiness.ready), Json(readiness))
}

async fn prometheus_text() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    let status = match encoder.encode(&prometheus::gather(), &mut body) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Failed to encode observer metrics");
            body.clear();
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        body,
    )
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(component_health))
        .route("/readyz", get(cycle_readiness))
        .route("/metrics", get(prometheus_text))
        .with_state(state)
}

/// Serve the status endpoints until the task is aborted
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Observer status API listening");

    axum::serve(listener, create_router(state)).await?;
    Ok(())
}
