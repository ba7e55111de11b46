use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{LimitsConfig, ModelSelection, RetrievalConfig, SessionConfig};
use crate::database::{
    DecompositionRecord, EmbeddingModelEntry, NewMessage, SessionRecord, SessionStatus,
    VectorStoreEntry,
};
use crate::logging::ActivityLogger;
use crate::models::ChatMessage;
use crate::services::conversation::{SessionMemoryManager, Summarizer};
use crate::services::gateways::{
    LanguageModelGateway, PersistenceGateway, RetrievalTarget, RetrievedChunk,
    VectorRetrievalGateway,
};
use crate::services::orchestrator::{EngineConfig, Gateways, RagOrchestrator};
use crate::utils::limiters::Limiters;

pub const DECOMPOSE_MODEL: &str = "decompose-model";
pub const MULTIQUERY_MODEL: &str = "multiquery-model";
pub const GENERATE_MODEL: &str = "generate-model";
pub const EVALUATE_MODEL: &str = "evaluate-model";
pub const SUMMARIZE_MODEL: &str = "summarize-model";

// ===== PERSISTENCE =====

#[derive(Default)]
struct StoreData {
    users: HashMap<String, DateTime<Utc>>,
    sessions: HashMap<String, SessionRecord>,
    messages: HashMap<String, Vec<ChatMessage>>,
    decompositions: Vec<DecompositionRecord>,
    vector_stores: HashMap<String, VectorStoreEntry>,
    embedding_models: HashMap<i32, EmbeddingModelEntry>,
}

/// Persistence gateway backed by hash maps, with switchable failures.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<StoreData>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        {
            let mut data = store.data.lock();
            data.embedding_models.insert(
                1,
                EmbeddingModelEntry {
                    id: 1,
                    name: "nomic-embed-text".into(),
                    provider: "llama.cpp".into(),
                    dimension: 768,
                },
            );
            data.vector_stores.insert(
                "default".into(),
                VectorStoreEntry {
                    id: 1,
                    name: "default".into(),
                    description: Some("healthcare articles".into()),
                    store_type: "pgvector".into(),
                    collection: "docs".into(),
                    embedding_model_id: Some(1),
                },
            );
        }
        Arc::new(store)
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("store read unavailable"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("store write unavailable"));
        }
        Ok(())
    }

    pub fn message_count(&self, session_id: &str) -> usize {
        self.data
            .lock()
            .messages
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.data
            .lock()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.data.lock().sessions.get(session_id).cloned()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.data.lock().users.contains_key(user_id)
    }

    pub fn decompositions(&self) -> Vec<DecompositionRecord> {
        self.data.lock().decompositions.clone()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryStore {
    async fn upsert_user(&self, user_id: &str) -> Result<()> {
        self.check_write()?;
        self.data.lock().users.insert(user_id.to_string(), Utc::now());
        Ok(())
    }

    async fn upsert_session(&self, session_id: &str, user_id: &str) -> Result<SessionRecord> {
        self.check_write()?;
        let mut data = self.data.lock();
        let now = Utc::now();
        let record = data
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                status: SessionStatus::Active,
                summary: None,
                summarized_through: 0,
                created_at: now,
                last_active_at: now,
            });
        record.status = SessionStatus::Active;
        record.last_active_at = now;
        Ok(record.clone())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.check_read()?;
        Ok(self.data.lock().sessions.get(session_id).cloned())
    }

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>> {
        self.check_read()?;
        let mut sessions: Vec<_> = self
            .data
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        Ok(sessions)
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        self.check_read()?;
        let messages = self.messages(session_id);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn messages_after(&self, session_id: &str, after_seq: i64) -> Result<Vec<ChatMessage>> {
        self.check_read()?;
        Ok(self
            .messages(session_id)
            .into_iter()
            .filter(|m| m.seq > after_seq)
            .collect())
    }

    async fn append_messages(
        &self,
        session_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<ChatMessage>> {
        self.check_write()?;
        let mut data = self.data.lock();
        if !data.sessions.contains_key(session_id) {
            return Err(anyhow!("session {} does not exist", session_id));
        }

        let stored = data.messages.entry(session_id.to_string()).or_default();
        let mut next_seq = stored.last().map(|m| m.seq).unwrap_or(0);
        let mut persisted = Vec::with_capacity(messages.len());
        for message in messages {
            next_seq += 1;
            persisted.push(ChatMessage {
                session_id: session_id.to_string(),
                seq: next_seq,
                role: message.role,
                content: message.content.clone(),
                created_at: Utc::now(),
                evaluation_score: message.evaluation_score,
                processing_time_ms: message.processing_time_ms,
            });
        }
        stored.extend(persisted.iter().cloned());

        if let Some(session) = data.sessions.get_mut(session_id) {
            session.last_active_at = Utc::now();
            session.status = SessionStatus::Active;
        }
        Ok(persisted)
    }

    async fn save_summary(&self, session_id: &str, summary: &str, summarized_through: i64) -> Result<()> {
        self.check_write()?;
        let mut data = self.data.lock();
        let session = data
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session {} does not exist", session_id))?;
        if session.summarized_through <= summarized_through {
            session.summary = Some(summary.to_string());
            session.summarized_through = summarized_through;
        }
        Ok(())
    }

    async fn mark_session_inactive(&self, session_id: &str, last_active_at: DateTime<Utc>) -> Result<()> {
        self.check_write()?;
        if let Some(session) = self.data.lock().sessions.get_mut(session_id) {
            session.status = SessionStatus::Inactive;
            session.last_active_at = session.last_active_at.max(last_active_at);
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.check_write()?;
        let mut data = self.data.lock();
        data.messages.remove(session_id);
        data.decompositions.retain(|d| d.session_id != session_id);
        Ok(data.sessions.remove(session_id).is_some())
    }

    async fn save_decomposition(&self, record: &DecompositionRecord) -> Result<()> {
        self.check_write()?;
        self.data.lock().decompositions.push(record.clone());
        Ok(())
    }

    async fn get_vector_store(&self, name: &str) -> Result<Option<VectorStoreEntry>> {
        self.check_read()?;
        Ok(self.data.lock().vector_stores.get(name).cloned())
    }

    async fn get_embedding_model(&self, id: i32) -> Result<Option<EmbeddingModelEntry>> {
        self.check_read()?;
        Ok(self.data.lock().embedding_models.get(&id).cloned())
    }
}

// ===== VECTOR SEARCH =====

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "at", "be", "by", "does", "for", "how", "in", "is", "it", "of", "on",
    "the", "to", "what", "with",
];

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| !w.is_empty() && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Scores documents by keyword overlap with the query.
pub struct KeywordVectorStore {
    corpus: Vec<(String, String)>,
    pub fail_all: AtomicBool,
    pub calls: AtomicUsize,
}

impl KeywordVectorStore {
    pub fn healthcare() -> Arc<Self> {
        let corpus = [
            ("d1", "AI improves medical diagnosis by analyzing scans and patient records"),
            ("d2", "Healthcare costs fall when AI automates administrative work in hospitals"),
            ("d3", "Risks of AI in patient care include bias and privacy concerns"),
            ("d4", "Recipes for baking bread at home"),
        ];
        Arc::new(Self {
            corpus: corpus
                .iter()
                .map(|(id, text)| (id.to_string(), text.to_string()))
                .collect(),
            fail_all: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl VectorRetrievalGateway for KeywordVectorStore {
    async fn similarity_search(
        &self,
        query: &str,
        target: &RetrievalTarget,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(anyhow!("vector store {} unreachable", target.collection));
        }

        let query_words = keywords(query);
        if query_words.is_empty() {
            return Ok(vec![]);
        }

        let mut hits: Vec<RetrievedChunk> = self
            .corpus
            .iter()
            .filter_map(|(id, text)| {
                let overlap = keywords(text).intersection(&query_words).count();
                (overlap > 0).then(|| RetrievedChunk {
                    document_id: id.clone(),
                    content: text.clone(),
                    score: overlap as f32 / query_words.len() as f32,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

// ===== LANGUAGE MODEL =====

/// Canned responses keyed by model name.
#[derive(Default)]
pub struct ScriptedLlm {
    pub fail_generation: AtomicBool,
    pub fail_summaries: AtomicBool,
    pub unparsable_scores: AtomicBool,
    pub summary_calls: AtomicUsize,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Prompts sent to `model`, oldest first.
    pub fn prompts_for(&self, model: &str) -> Vec<String> {
        self.prompts
            .lock()
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageModelGateway for ScriptedLlm {
    async fn generate_text(&self, prompt: &str, model: &str) -> Result<String> {
        self.prompts.lock().push((model.to_string(), prompt.to_string()));

        match model {
            DECOMPOSE_MODEL => Ok("1. How is AI used in medical diagnosis?\n\
                 2. How does AI affect healthcare costs?\n\
                 3. What are the risks of AI in patient care?"
                .to_string()),
            MULTIQUERY_MODEL => {
                let question = prompt.rsplit("Original question: ").next().unwrap_or(prompt);
                Ok(format!(
                    "1. Explain {}\n2. Details about {}",
                    question.trim(),
                    question.trim()
                ))
            }
            GENERATE_MODEL => {
                if self.fail_generation.load(Ordering::SeqCst) {
                    return Err(anyhow!("model overloaded"));
                }
                Ok("ANSWER:\nAI improves diagnosis and lowers administrative costs, \
                    but brings bias and privacy risks.\n\n\
                    SUGGESTED QUESTIONS:\n\
                    - How accurate is AI diagnosis?\n\
                    - Which hospital tasks can AI automate?"
                    .to_string())
            }
            EVALUATE_MODEL => {
                if self.unparsable_scores.load(Ordering::SeqCst) {
                    Ok("The response looks fine.".to_string())
                } else {
                    Ok("0.85".to_string())
                }
            }
            SUMMARIZE_MODEL => {
                if self.fail_summaries.load(Ordering::SeqCst) {
                    return Err(anyhow!("summarizer unavailable"));
                }
                let n = self.summary_calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("Summary v{}: the user is asking about AI in healthcare.", n))
            }
            other => Err(anyhow!("unknown model {}", other)),
        }
    }
}

// ===== BUILDERS =====

pub fn test_models() -> ModelSelection {
    ModelSelection {
        decomposition: DECOMPOSE_MODEL.into(),
        multiquery: MULTIQUERY_MODEL.into(),
        generation: GENERATE_MODEL.into(),
        evaluation: EVALUATE_MODEL.into(),
        summarization: SUMMARIZE_MODEL.into(),
    }
}

pub fn test_limits() -> LimitsConfig {
    LimitsConfig {
        call_timeout_ms: 2_000,
        acquire_timeout_ms: 2_000,
        llm_concurrency: 8,
        generation_retries: 2,
        retry_backoff_ms: 1,
    }
}

pub fn session_config(summarization_threshold: usize) -> SessionConfig {
    SessionConfig {
        summarization_threshold,
        ..SessionConfig::default()
    }
}

pub struct TestEngine {
    pub engine: RagOrchestrator,
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<ScriptedLlm>,
    pub vectors: Arc<KeywordVectorStore>,
}

pub fn test_engine(session: SessionConfig) -> TestEngine {
    let store = InMemoryStore::new();
    let llm = ScriptedLlm::new();
    let vectors = KeywordVectorStore::healthcare();

    let engine = RagOrchestrator::new(
        Gateways {
            llm: llm.clone(),
            vectors: vectors.clone(),
            store: store.clone(),
        },
        EngineConfig {
            models: test_models(),
            session,
            retrieval: RetrievalConfig::default(),
            limits: test_limits(),
        },
        ActivityLogger::disabled(),
    );

    TestEngine {
        engine,
        store,
        llm,
        vectors,
    }
}

pub struct TestSessions {
    pub manager: Arc<SessionMemoryManager>,
    pub store: Arc<InMemoryStore>,
    pub llm: Arc<ScriptedLlm>,
}

pub fn test_sessions(config: SessionConfig) -> TestSessions {
    let store = InMemoryStore::new();
    let llm = ScriptedLlm::new();
    let summarizer = Summarizer::new(llm.clone(), SUMMARIZE_MODEL, Limiters::default(), &config);
    let manager = Arc::new(SessionMemoryManager::new(
        store.clone(),
        summarizer,
        config,
        Duration::from_secs(2),
        ActivityLogger::disabled(),
    ));

    TestSessions {
        manager,
        store,
        llm,
    }
}
