//! ヘルスチェック

use axum::{extract::State, Json};
use serde::Serialize;

use super::SharedState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
    pub num_classes: Option<usize>,
    pub device: Option<String>,
    pub version: &'static str,
}

/// GET /health
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let service = &state.service;
    let ready = service.is_ready();
    let status = if ready {
        "ok"
    } else if service.fatal_error().is_some() {
        "failed"
    } else {
        "loading"
    };

    Json(HealthResponse {
        status,
        ready,
        num_classes: service.num_classes(),
        device: service.device_name(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
