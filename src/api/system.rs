// Probes and diagnostics. Mounted outside the API prefix, no API key needed.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::api::routes::AppState;

const SERVICE_NAME: &str = "vm-lifecycle-manager";

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
        "uptime_seconds": uptime,
    }))
}

/// Ready once storage answers a ping.
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
    match state.service.repository().ping().await {
        Ok(()) => Json(json!({
            "status": "ready",
            "checks": { "database": "ok" },
        }))
        .into_response(),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "checks": { "database": "unavailable" },
                })),
            )
                .into_response()
        }
    }
}

pub async fn live() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

pub async fn version(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.settings.server.mode,
    }))
}

/// Prometheus text exposition. Fleet gauges are refreshed on every scrape.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.service.get_resource_summary().await {
        Ok(summary) => state.metrics.update_fleet(&summary),
        Err(e) => warn!("Could not refresh fleet gauges: {}", e),
    }

    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
