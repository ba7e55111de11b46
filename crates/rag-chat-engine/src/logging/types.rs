use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Activity type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    RequestReceived,    // Initial query
    MessageSent,        // Turn persisted and answered
    RetrievalError,
    LlmError,
    SessionCreated,
    SessionHydrated,
    SessionEvicted,
    SessionDeleted,
    SummarizationApplied,
    SummarizationFailed,
    EvaluationFallback,
    ProcessingStage,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestReceived => "request_received",
            Self::MessageSent => "message_sent",
            Self::RetrievalError => "retrieval_error",
            Self::LlmError => "llm_error",
            Self::SessionCreated => "session_created",
            Self::SessionHydrated => "session_hydrated",
            Self::SessionEvicted => "session_evicted",
            Self::SessionDeleted => "session_deleted",
            Self::SummarizationApplied => "summarization_applied",
            Self::SummarizationFailed => "summarization_failed",
            Self::EvaluationFallback => "evaluation_fallback",
            Self::ProcessingStage => "processing_stage",
        }
    }
}

/// Activity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// Complete activity log entry
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub session_id: String,
    pub user_id: Option<String>,

    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,
    /// Orchestrator stage the entry belongs to
    pub stage: Option<String>,

    pub message_content: Option<String>,
    pub response_content: Option<String>,

    pub token_count: Option<i32>,
    pub evaluation_score: Option<f32>,

    pub processing_time_ms: Option<i32>,
    pub llm_call_duration_ms: Option<i32>,
    pub retrieval_duration_ms: Option<i32>,

    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub created_at: DateTime<Utc>,

    pub custom_fields: Option<HashMap<String, Value>>,
}

impl ActivityLog {
    pub fn builder(session_id: impl Into<String>, activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(session_id.into(), activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(session_id: String, activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                session_id,
                user_id: None,
                activity_type,
                activity_status: ActivityStatus::Success,
                stage: None,
                message_content: None,
                response_content: None,
                token_count: None,
                evaluation_score: None,
                processing_time_ms: None,
                llm_call_duration_ms: None,
                retrieval_duration_ms: None,
                error_message: None,
                error_type: None,
                created_at: Utc::now(),
                custom_fields: None,
            },
        }
    }

    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.log.user_id = user_id.map(str::to_string);
        self
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn stage(mut self, stage: &str) -> Self {
        self.log.stage = Some(stage.to_string());
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message_content = Some(content.into());
        self
    }

    pub fn response(mut self, content: impl Into<String>) -> Self {
        self.log.response_content = Some(content.into());
        self
    }

    pub fn token_count(mut self, count: usize) -> Self {
        self.log.token_count = Some(count.min(i32::MAX as usize) as i32);
        self
    }

    pub fn evaluation_score(mut self, score: f32) -> Self {
        self.log.evaluation_score = Some(score);
        self
    }

    pub fn processing_time(mut self, ms: u128) -> Self {
        self.log.processing_time_ms = Some(ms.min(i32::MAX as u128) as i32);
        self
    }

    pub fn llm_duration(mut self, ms: u128) -> Self {
        self.log.llm_call_duration_ms = Some(ms.min(i32::MAX as u128) as i32);
        self
    }

    pub fn retrieval_duration(mut self, ms: u128) -> Self {
        self.log.retrieval_duration_ms = Some(ms.min(i32::MAX as u128) as i32);
        self
    }

    pub fn error(mut self, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        self.log.error_message = Some(message.into());
        self.log.error_type = Some(error_type.into());
        self.log.activity_status = ActivityStatus::Error;
        self
    }

    /// Add custom key-value data, stored as JSON
    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.log
            .custom_fields
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
