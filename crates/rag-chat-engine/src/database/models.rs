use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
}

impl SessionStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "inactive" => Self::Inactive,
            _ => Self::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub summary: Option<String>,
    /// Highest message seq folded into `summary`; 0 when nothing was summarized
    pub summarized_through: i64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct SessionRow {
    pub session_id: String,
    pub user_id: String,
    pub status: String,
    pub summary: Option<String>,
    pub summarized_through: i64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            user_id: row.user_id,
            status: SessionStatus::parse(&row.status),
            summary: row.summary,
            summarized_through: row.summarized_through,
            created_at: row.created_at,
            last_active_at: row.last_active_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct MessageRow {
    pub session_id: String,
    pub seq: i64,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub evaluation_score: Option<f32>,
    pub processing_time_ms: Option<i64>,
}

/// Message not yet assigned a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub evaluation_score: Option<f32>,
    pub processing_time_ms: Option<i64>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            evaluation_score: None,
            processing_time_ms: None,
        }
    }

    pub fn assistant(content: impl Into<String>, score: f32, processing_time_ms: i64) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            evaluation_score: Some(score),
            processing_time_ms: Some(processing_time_ms),
        }
    }
}

/// Written once per chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionRecord {
    pub id: Uuid,
    pub session_id: String,
    /// Seq of the user message this decomposition answered
    pub message_seq: Option<i64>,
    pub original_query: String,
    pub sub_questions: Vec<String>,
    /// Variants per sub-question, same order as `sub_questions`
    pub variants: Vec<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct VectorStoreEntry {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub store_type: String,
    pub collection: String,
    pub embedding_model_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct EmbeddingModelEntry {
    pub id: i32,
    pub name: String,
    pub provider: String,
    pub dimension: i32,
}
