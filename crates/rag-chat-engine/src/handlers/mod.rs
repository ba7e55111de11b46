pub mod chat;
pub mod health;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/chat", post(chat::chat_handler))
        .route("/sessions/active", get(chat::active_sessions_handler))
        .route("/sessions/{session_id}", delete(chat::delete_session_handler))
        .route("/sessions/{session_id}/summarize", post(chat::summarize_handler))
        .route("/sessions/{session_id}/history", get(chat::history_handler))
        .route("/users/{user_id}/sessions", get(chat::user_sessions_handler))
        .route("/cleanup", post(chat::cleanup_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
}
