use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;

use crate::director::ProgramDirector;
use crate::horizon::HorizonHealthReport;

#[derive(Clone)]
pub struct AppState {
    pub director: Arc<ProgramDirector>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .route("/status/{slug}", get(channel_status_handler))
        .with_state(state)
}

/// Liveness: "up" in any boundary state, including FAILED_TERMINAL.
async fn healthz_handler() -> &'static str {
    "ok"
}

fn horizon_json(health: &Option<HorizonHealthReport>) -> serde_json::Value {
    match health {
        Some(report) => json!({
            "exec_depth_ms": report.exec_depth_ms,
            "execution_compliant": report.execution_compliant,
            "extension_attempt_count": report.extension_attempt_count,
            "extension_success_count": report.extension_success_count,
        }),
        None => serde_json::Value::Null,
    }
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let channels: Vec<serde_json::Value> = state
        .director
        .statuses()
        .iter()
        .map(|(status, health)| {
            json!({
                "channel": status,
                "horizon": horizon_json(health),
            })
        })
        .collect();

    Json(json!({
        "emergency": state.director.is_emergency(),
        "channels": channels,
    }))
    .into_response()
}

async fn channel_status_handler(State(state): State<AppState>, Path(slug): Path<String>) -> Response {
    match state.director.status_of(&slug) {
        Some((status, health)) => Json(json!({
            "channel": status,
            "horizon": horizon_json(&health),
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, format!("No channel '{slug}'")).into_response(),
    }
}
