use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::database::SessionRecord;
use crate::models::chat::*;
use crate::services::RagOrchestrator;
use crate::utils::ChatError;

const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn chat_handler(
    State(engine): State<Arc<RagOrchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ChatError> {
    if request.query.trim().is_empty() {
        return Err(ChatError::InvalidRequest("query must not be empty".to_string()));
    }

    info!(
        session_id = request.session_id.as_deref().unwrap_or("-"),
        query_len = request.query.len(),
        "Chat request"
    );

    let response = engine.handle_chat(request).await?;
    Ok(Json(response))
}

pub async fn summarize_handler(
    State(engine): State<Arc<RagOrchestrator>>,
    Path(session_id): Path<String>,
) -> Result<Json<SummaryResponse>, ChatError> {
    let summary = engine.summarize_now(&session_id).await?;
    Ok(Json(SummaryResponse {
        session_id,
        summary,
    }))
}

pub async fn active_sessions_handler(
    State(engine): State<Arc<RagOrchestrator>>,
) -> Json<ActiveSessionsResponse> {
    Json(ActiveSessionsResponse {
        active_sessions: engine.get_active_session_count(),
    })
}

pub async fn cleanup_handler(State(engine): State<Arc<RagOrchestrator>>) -> Json<CleanupResponse> {
    let evicted = engine.cleanup_now().await;
    Json(CleanupResponse {
        evicted,
        active_sessions: engine.get_active_session_count(),
    })
}

pub async fn history_handler(
    State(engine): State<Arc<RagOrchestrator>>,
    Path(session_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ChatError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).max(1);
    let messages = engine.session_history(&session_id, limit).await?;
    Ok(Json(HistoryResponse {
        session_id,
        messages,
    }))
}

pub async fn user_sessions_handler(
    State(engine): State<Arc<RagOrchestrator>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SessionRecord>>, ChatError> {
    Ok(Json(engine.user_sessions(&user_id).await?))
}

pub async fn delete_session_handler(
    State(engine): State<Arc<RagOrchestrator>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ChatError> {
    if engine.delete_session(&session_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ChatError::NotFound(format!("session {} not found", session_id)))
    }
}
