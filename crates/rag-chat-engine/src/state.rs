use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Settings;
use crate::services::RagOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RagOrchestrator>,
    pub settings: Arc<Settings>,
}

impl FromRef<AppState> for Arc<RagOrchestrator> {
    fn from_ref(state: &AppState) -> Self {
        state.engine.clone()
    }
}

impl FromRef<AppState> for Arc<Settings> {
    fn from_ref(state: &AppState) -> Self {
        state.settings.clone()
    }
}
