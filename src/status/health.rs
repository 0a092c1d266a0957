//! Probe and introspection handlers
//!
//! ```yaml
//! livenessProbe:
//!   httpGet:
//!     path: /health/live
//!     port: 9090
//! readinessProbe:
//!   httpGet:
//!     path: /health/ready
//!     port: 9090
//! ```

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::StatusState;
use crate::cluster::NodeStatus;
use crate::metrics;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    pub registered: bool,
    pub node_status: NodeStatus,
    pub timestamp: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// Always 200 while the process is serving
pub async fn liveness_probe(State(state): State<StatusState>) -> impl IntoResponse {
    Json(LivenessResponse {
        status: HealthStatus::Healthy,
        uptime_secs: state.start_time.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// 200 once the node is registered and in the working family
pub async fn readiness_probe(State(state): State<StatusState>) -> impl IntoResponse {
    let registered = state.context.is_registered();
    let node_status = state.context.status().await;
    let status = if registered && node_status.is_working() {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    let response = ReadinessResponse {
        status,
        registered,
        node_status,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (status.status_code(), Json(response))
}

/// Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("failed to encode metrics: {e}"),
        ),
    }
}

/// Snapshot of the node context
pub async fn node_snapshot(State(state): State<StatusState>) -> impl IntoResponse {
    Json(state.context.snapshot().await)
}
