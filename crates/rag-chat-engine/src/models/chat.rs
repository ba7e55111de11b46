use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SessionId = String;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One persisted chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub session_id: SessionId,
    /// Per-session sequence number, strictly increasing.
    pub seq: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
}

// ===== REQUEST MODELS =====

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Registry name of the vector store to search; default store when absent
    #[serde(default)]
    pub vector_store: Option<String>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: None,
            session_id: None,
            vector_store: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_vector_store(mut self, name: impl Into<String>) -> Self {
        self.vector_store = Some(name.into());
        self
    }
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub suggested_questions: Vec<String>,
    pub evaluation_score: f32,
    /// Seconds
    pub processing_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryResponse {
    pub session_id: SessionId,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveSessionsResponse {
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupResponse {
    pub evicted: usize,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub session_id: SessionId,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub active_sessions: usize,
    /// Per-session lock slots, including sessions being hydrated
    pub cached_slots: usize,
    pub activity_queue_len: usize,
}
