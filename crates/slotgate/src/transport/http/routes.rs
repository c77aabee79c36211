//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Serialize;

use crate::health::AdmissionHealth;
use crate::kind::SlotKindType;
use crate::tuner::{AdmissionSnapshot, WorkerTuner};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: AdmissionHealth,
    pub version: VersionInfo,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub kind: SlotKindType,
    pub paused: bool,
}

async fn health_check(State(tuner): State<Arc<WorkerTuner>>) -> impl IntoResponse {
    let status = tuner.health();
    // Probes should stop routing work to a defunct worker.
    let code = if status.is_defunct() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(HealthCheckResponse {
            status,
            version: tuner.version().clone(),
        }),
    )
}

async fn slots(State(tuner): State<Arc<WorkerTuner>>) -> Json<AdmissionSnapshot> {
    Json(tuner.snapshot())
}

fn set_paused(tuner: &WorkerTuner, kind: &str, paused: bool) -> axum::response::Response {
    let kind: SlotKindType = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": format!("{e}") })),
            )
                .into_response();
        }
    };
    if paused {
        tuner.pause(kind);
    } else {
        tuner.resume(kind);
    }
    tracing::info!(%kind, paused, "Slot admission toggled via HTTP");
    (
        StatusCode::OK,
        Json(PauseResponse {
            kind,
            paused: tuner.is_paused(kind),
        }),
    )
        .into_response()
}

async fn pause(
    State(tuner): State<Arc<WorkerTuner>>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    set_paused(&tuner, &kind, true)
}

async fn resume(
    State(tuner): State<Arc<WorkerTuner>>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    set_paused(&tuner, &kind, false)
}

pub fn routes(tuner: Arc<WorkerTuner>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/slots", get(slots))
        .route("/slots/{kind}/pause", post(pause))
        .route("/slots/{kind}/resume", post(resume))
        .with_state(tuner)
}
