use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::types::Json;
use sqlx::FromRow;
use tracing::{debug, info};

use super::models::{MessageRow, SessionRow};
use super::{
    DbPool, DecompositionRecord, EmbeddingModelEntry, NewMessage, SessionRecord, VectorStoreEntry,
};
use crate::logging::{ActivityLog, ActivitySink};
use crate::models::{ChatMessage, Role};
use crate::services::gateways::{PersistenceGateway, RetrievedChunk};

const SESSION_COLUMNS: &str =
    "session_id, user_id, status, summary, summarized_through, created_at, last_active_at";

const MESSAGE_COLUMNS: &str =
    "session_id, seq, role, content, created_at, evaluation_score, processing_time_ms";

pub struct Repository {
    pub pool: DbPool,
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    chunk_id: i64,
    content: String,
    similarity: f32,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = anyhow::Error;

    fn try_from(row: MessageRow) -> Result<Self> {
        let role = Role::parse(&row.role)
            .ok_or_else(|| anyhow!("unknown role '{}' in session {}", row.role, row.session_id))?;
        Ok(Self {
            session_id: row.session_id,
            seq: row.seq,
            role,
            content: row.content,
            created_at: row.created_at,
            evaluation_score: row.evaluation_score,
            processing_time_ms: row.processing_time_ms,
        })
    }
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<ChatMessage>> {
    rows.into_iter().map(ChatMessage::try_from).collect()
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create tables if missing. Safe to run on every start.
    pub async fn ensure_schema(&self, embedding_dimension: usize) -> Result<()> {
        let statements = [
            "CREATE EXTENSION IF NOT EXISTS vector".to_string(),
            r#"CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_seen_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS chat_sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                status TEXT NOT NULL DEFAULT 'active',
                summary TEXT,
                summarized_through BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_active_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id BIGSERIAL PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(session_id) ON DELETE CASCADE,
                seq BIGINT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                evaluation_score REAL,
                processing_time_ms BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE (session_id, seq)
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS query_decompositions (
                id UUID PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES chat_sessions(session_id) ON DELETE CASCADE,
                message_seq BIGINT,
                original_query TEXT NOT NULL,
                sub_questions JSONB NOT NULL,
                variants JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS embedding_models (
                id SERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                provider TEXT NOT NULL,
                dimension INT NOT NULL
            )"#
            .to_string(),
            r#"CREATE TABLE IF NOT EXISTS vector_stores (
                id SERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                store_type TEXT NOT NULL DEFAULT 'pgvector',
                collection TEXT NOT NULL,
                embedding_model_id INT REFERENCES embedding_models(id)
            )"#
            .to_string(),
            format!(
                r#"CREATE TABLE IF NOT EXISTS rag_chunks (
                id BIGSERIAL PRIMARY KEY,
                collection TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding vector({}) NOT NULL
            )"#,
                embedding_dimension
            ),
            "CREATE INDEX IF NOT EXISTS idx_rag_chunks_collection ON rag_chunks(collection)"
                .to_string(),
            r#"CREATE TABLE IF NOT EXISTS activity_logs (
                id BIGSERIAL PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT,
                activity_type TEXT NOT NULL,
                activity_status TEXT NOT NULL,
                stage TEXT,
                message_content TEXT,
                response_content TEXT,
                token_count INT,
                evaluation_score REAL,
                processing_time_ms INT,
                llm_call_duration_ms INT,
                retrieval_duration_ms INT,
                error_message TEXT,
                error_type TEXT,
                custom_fields JSONB,
                created_at TIMESTAMPTZ NOT NULL
            )"#
            .to_string(),
        ];

        for statement in statements.iter() {
            sqlx::query(statement)
                .execute(self.pool.get_pool())
                .await
                .with_context(|| format!("schema statement failed: {}", statement.lines().next().unwrap_or_default()))?;
        }

        info!("Database schema ready (embedding dimension {})", embedding_dimension);
        Ok(())
    }

    /// Cosine similarity search over one collection.
    pub async fn search_chunks(
        &self,
        collection: &str,
        embedding: Vector,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let rows = sqlx::query_as::<_, ChunkRow>(
            r#"SELECT
                id AS chunk_id,
                content,
                (1 - (embedding <=> $1))::real AS similarity
               FROM rag_chunks
               WHERE collection = $2
               ORDER BY embedding <=> $1
               LIMIT $3"#,
        )
        .bind(embedding)
        .bind(collection)
        .bind(top_k as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!("Vector search in '{}' returned {} chunks", collection, rows.len());

        Ok(rows
            .into_iter()
            .map(|row| RetrievedChunk {
                document_id: row.chunk_id.to_string(),
                content: row.content,
                score: row.similarity,
            })
            .collect())
    }
}

#[async_trait]
impl PersistenceGateway for Repository {
    async fn upsert_user(&self, user_id: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO users (user_id) VALUES ($1)
               ON CONFLICT (user_id) DO UPDATE SET last_seen_at = now()"#,
        )
        .bind(user_id)
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn upsert_session(&self, session_id: &str, user_id: &str) -> Result<SessionRecord> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"INSERT INTO chat_sessions (session_id, user_id) VALUES ($1, $2)
               ON CONFLICT (session_id) DO UPDATE
                 SET status = 'active', last_active_at = now()
               RETURNING {}"#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_one(self.pool.get_pool())
        .await?;
        Ok(row.into())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM chat_sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(self.pool.get_pool())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM chat_sessions WHERE user_id = $1 ORDER BY last_active_at DESC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(self.pool.get_pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"SELECT {cols} FROM (
                 SELECT {cols} FROM chat_messages
                 WHERE session_id = $1
                 ORDER BY seq DESC
                 LIMIT $2
               ) recent ORDER BY seq ASC"#,
            cols = MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(self.pool.get_pool())
        .await?;
        into_messages(rows)
    }

    async fn messages_after(&self, session_id: &str, after_seq: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = $1 AND seq > $2 ORDER BY seq ASC",
            MESSAGE_COLUMNS
        ))
        .bind(session_id)
        .bind(after_seq)
        .fetch_all(self.pool.get_pool())
        .await?;
        into_messages(rows)
    }

    async fn append_messages(
        &self,
        session_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<ChatMessage>> {
        let mut tx = self.pool.get_pool().begin().await?;

        // Row lock serializes appends to the same session across processes
        sqlx::query("SELECT 1 FROM chat_sessions WHERE session_id = $1 FOR UPDATE")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("session {} does not exist", session_id))?;

        let mut next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM chat_messages WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut persisted = Vec::with_capacity(messages.len());
        for message in messages {
            next_seq += 1;
            let row = sqlx::query_as::<_, MessageRow>(&format!(
                r#"INSERT INTO chat_messages
                     (session_id, seq, role, content, evaluation_score, processing_time_ms)
                   VALUES ($1, $2, $3, $4, $5, $6)
                   RETURNING {}"#,
                MESSAGE_COLUMNS
            ))
            .bind(session_id)
            .bind(next_seq)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.evaluation_score)
            .bind(message.processing_time_ms)
            .fetch_one(&mut *tx)
            .await?;
            persisted.push(ChatMessage::try_from(row)?);
        }

        sqlx::query(
            "UPDATE chat_sessions SET last_active_at = now(), status = 'active' WHERE session_id = $1",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(persisted)
    }

    async fn save_summary(
        &self,
        session_id: &str,
        summary: &str,
        summarized_through: i64,
    ) -> Result<()> {
        // Watermark never moves backwards
        sqlx::query(
            r#"UPDATE chat_sessions
               SET summary = $2, summarized_through = $3
               WHERE session_id = $1 AND summarized_through <= $3"#,
        )
        .bind(session_id)
        .bind(summary)
        .bind(summarized_through)
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn mark_session_inactive(
        &self,
        session_id: &str,
        last_active_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE chat_sessions
               SET status = 'inactive', last_active_at = GREATEST(last_active_at, $2)
               WHERE session_id = $1"#,
        )
        .bind(session_id)
        .bind(last_active_at)
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(self.pool.get_pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_decomposition(&self, record: &DecompositionRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO query_decompositions
                 (id, session_id, message_seq, original_query, sub_questions, variants, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(record.id)
        .bind(&record.session_id)
        .bind(record.message_seq)
        .bind(&record.original_query)
        .bind(Json(&record.sub_questions))
        .bind(Json(&record.variants))
        .bind(record.created_at)
        .execute(self.pool.get_pool())
        .await?;
        Ok(())
    }

    async fn get_vector_store(&self, name: &str) -> Result<Option<VectorStoreEntry>> {
        let entry = sqlx::query_as::<_, VectorStoreEntry>(
            r#"SELECT id, name, description, store_type, collection, embedding_model_id
               FROM vector_stores WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(self.pool.get_pool())
        .await?;
        Ok(entry)
    }

    async fn get_embedding_model(&self, id: i32) -> Result<Option<EmbeddingModelEntry>> {
        let entry = sqlx::query_as::<_, EmbeddingModelEntry>(
            "SELECT id, name, provider, dimension FROM embedding_models WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.get_pool())
        .await?;
        Ok(entry)
    }
}

#[async_trait]
impl ActivitySink for Repository {
    async fn insert_batch(&self, logs: &[ActivityLog]) -> Result<usize> {
        let mut query_builder = sqlx::QueryBuilder::new(
            r#"
            INSERT INTO activity_logs (
                session_id, user_id, activity_type, activity_status, stage,
                message_content, response_content, token_count, evaluation_score,
                processing_time_ms, llm_call_duration_ms, retrieval_duration_ms,
                error_message, error_type, custom_fields, created_at
            )
            "#,
        );

        query_builder.push_values(logs, |mut b, log| {
            b.push_bind(&log.session_id)
                .push_bind(&log.user_id)
                .push_bind(log.activity_type.as_str())
                .push_bind(log.activity_status.as_str())
                .push_bind(&log.stage)
                .push_bind(&log.message_content)
                .push_bind(&log.response_content)
                .push_bind(log.token_count)
                .push_bind(log.evaluation_score)
                .push_bind(log.processing_time_ms)
                .push_bind(log.llm_call_duration_ms)
                .push_bind(log.retrieval_duration_ms)
                .push_bind(&log.error_message)
                .push_bind(&log.error_type)
                .push_bind(log.custom_fields.as_ref().map(Json))
                .push_bind(log.created_at);
        });

        let result = query_builder.build().execute(self.pool.get_pool()).await?;
        Ok(result.rows_affected() as usize)
    }
}
