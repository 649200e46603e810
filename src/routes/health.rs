use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::pipeline::IngestStatsSnapshot;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub application_name: String,
    pub mqtt_connected: bool,
    pub subscribers: usize,
    pub ingest: IngestStatsSnapshot,
}

pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ingest = state.ingest_stats.snapshot();
    Json(HealthResponse {
        status: if ingest.last_error.is_none() { "ok" } else { "degraded" },
        application_name: state.config.application_name.clone(),
        mqtt_connected: ingest.mqtt_connected,
        subscribers: state.broadcaster.subscriber_count().await,
        ingest,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
