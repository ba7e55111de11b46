use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Settings;
use crate::services::RagOrchestrator;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    active_sessions: usize,
    cached_slots: usize,
    activity_queue_len: usize,
    default_vector_store: String,
}

pub async fn health_check(
    State(engine): State<Arc<RagOrchestrator>>,
    State(settings): State<Arc<Settings>>,
) -> (StatusCode, Json<HealthResponse>) {
    let stats = engine.stats();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            active_sessions: stats.active_sessions,
            cached_slots: stats.cached_slots,
            activity_queue_len: stats.activity_queue_len,
            default_vector_store: settings.retrieval.default_vector_store.clone(),
        }),
    )
}
