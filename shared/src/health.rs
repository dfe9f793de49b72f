// ============================================================================
// Worker health signal
// ============================================================================
//
// Shared by every consumer member of the worker process and served on
// `/health` for the orchestrator's liveness/readiness probes.
//
// Starting -> Ready -> Degraded (broker errors, below the ceiling) -> Failed
//
// Failed is terminal: once a member gives up on the broker the process must
// be restarted.
//
// ============================================================================

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::metrics::gather_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Starting = 0,
    Ready = 1,
    Degraded = 2,
    Failed = 3,
}

impl HealthStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthStatus::Ready,
            2 => HealthStatus::Degraded,
            3 => HealthStatus::Failed,
            _ => HealthStatus::Starting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Ready => "ready",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failed => "failed",
        }
    }

    pub fn is_serving(&self) -> bool {
        matches!(self, HealthStatus::Ready | HealthStatus::Degraded)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthState {
    status: Arc<AtomicU8>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn transition(&self, next: HealthStatus) {
        let _ = self
            .status
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != HealthStatus::Failed as u8).then_some(next as u8)
            });
    }

    pub fn set_ready(&self) {
        self.transition(HealthStatus::Ready);
    }

    pub fn set_degraded(&self) {
        self.transition(HealthStatus::Degraded);
    }

    pub fn set_failed(&self) {
        self.status
            .store(HealthStatus::Failed as u8, Ordering::SeqCst);
    }
}

async fn health_check(State(health): State<HealthState>) -> Response {
    let status = health.status();
    let code = if status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "status": status.as_str() }))).into_response()
}

async fn metrics_handler() -> Response {
    match gather_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to gather metrics: {}", e),
        )
            .into_response(),
    }
}

/// `/health` and `/metrics` for the hosting process
pub fn health_router(health: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(health)
}
