//! `/metrics` and `/health` endpoint.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use nanny_core::driver::{CycleOutcome, CycleStatus};
use nanny_core::NannyMetrics;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct ServerState {
    pub metrics: Arc<NannyMetrics>,
    pub status: watch::Receiver<Option<CycleStatus>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve(port: u16, state: ServerState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics endpoint listening on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// 200 until a cycle has failed; the body describes the last finished cycle.
async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let last = state.status.borrow().clone();
    let Some(last) = last else {
        return (StatusCode::OK, Json(json!({ "status": "starting" })));
    };
    let (code, status, error) = match &last.outcome {
        CycleOutcome::Completed => (StatusCode::OK, "ok", None),
        CycleOutcome::Cancelled => (StatusCode::OK, "stopping", None),
        CycleOutcome::Failed(e) => (StatusCode::SERVICE_UNAVAILABLE, "degraded", Some(e.clone())),
    };
    (
        code,
        Json(json!({
            "status": status,
            "nanny": last.nanny,
            "cycle": last.cycle,
            "forced_dry_run": last.forced_dry_run,
            "finished_at": last.finished_at.to_rfc3339(),
            "error": error,
        })),
    )
}
