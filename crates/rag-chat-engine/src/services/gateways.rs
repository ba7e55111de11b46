//! Collaborator interfaces consumed by the engine.
//!
//! Gateways speak `anyhow::Result`; components convert failures into
//! [`ChatError`](crate::utils::ChatError) at their own boundary.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::{
    DecompositionRecord, EmbeddingModelEntry, NewMessage, SessionRecord, VectorStoreEntry,
};
use crate::models::ChatMessage;
use crate::utils::text::parse_score;

/// One similarity-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub content: String,
    pub score: f32,
}

/// Where a similarity search runs, resolved from the vector store registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalTarget {
    pub store_name: String,
    pub collection: String,
    pub embedding_model: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModelGateway: Send + Sync {
    async fn generate_text(&self, prompt: &str, model: &str) -> Result<String>;

    /// `Ok(None)` when the model answered but no score could be parsed.
    async fn score_text(&self, prompt: &str, model: &str) -> Result<Option<f64>> {
        let output = self.generate_text(prompt, model).await?;
        Ok(parse_score(&output))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorRetrievalGateway: Send + Sync {
    /// Hits ordered by descending similarity.
    async fn similarity_search(
        &self,
        query: &str,
        target: &RetrievalTarget,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>>;
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Insert the user or refresh `last_seen_at`.
    async fn upsert_user(&self, user_id: &str) -> Result<()>;

    /// Insert the session or mark it active again. Ownership is never changed.
    async fn upsert_session(&self, session_id: &str, user_id: &str) -> Result<SessionRecord>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>>;

    /// Most recent `limit` messages in ascending sequence order.
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    /// All messages with `seq > after_seq`, ascending.
    async fn messages_after(&self, session_id: &str, after_seq: i64) -> Result<Vec<ChatMessage>>;

    /// Append in one transaction, assigning consecutive sequence numbers.
    async fn append_messages(
        &self,
        session_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<ChatMessage>>;

    async fn save_summary(
        &self,
        session_id: &str,
        summary: &str,
        summarized_through: i64,
    ) -> Result<()>;

    async fn mark_session_inactive(
        &self,
        session_id: &str,
        last_active_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns false when the session did not exist.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    async fn save_decomposition(&self, record: &DecompositionRecord) -> Result<()>;

    async fn get_vector_store(&self, name: &str) -> Result<Option<VectorStoreEntry>>;

    async fn get_embedding_model(&self, id: i32) -> Result<Option<EmbeddingModelEntry>>;
}
