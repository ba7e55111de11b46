use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{LimitsConfig, ModelSelection, RetrievalConfig, SessionConfig, Settings};
use crate::database::{DecompositionRecord, SessionRecord};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::{ChatMessage, ChatRequest, ChatResponse, EngineStats};
use crate::services::conversation::{NewTurn, SessionMemoryManager, SessionReaper, Summarizer};
use crate::services::gateways::{
    LanguageModelGateway, PersistenceGateway, RetrievalTarget, VectorRetrievalGateway,
};
use crate::services::pipeline::{
    build_context, reciprocal_rank_fusion, MultiQueryExpander, ParallelRetriever,
    QueryDecomposer, ResponseEvaluator, ResponseGenerator,
};
use crate::utils::limiters::Limiters;
use crate::utils::text::dedup_normalized;
use crate::utils::{ChatError, ChatResult, ErrorKind};

/// Progress of one chat request. `Error` is reachable from every other stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    ContextLoaded,
    Decomposed,
    Expanded,
    Retrieved,
    Fused,
    ContextBuilt,
    Generated,
    Evaluated,
    Persisted,
    Done,
    Error,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::ContextLoaded => "CONTEXT_LOADED",
            Self::Decomposed => "DECOMPOSED",
            Self::Expanded => "EXPANDED",
            Self::Retrieved => "RETRIEVED",
            Self::Fused => "FUSED",
            Self::ContextBuilt => "CONTEXT_BUILT",
            Self::Generated => "GENERATED",
            Self::Evaluated => "EVALUATED",
            Self::Persisted => "PERSISTED",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

/// External collaborators the engine is built on.
#[derive(Clone)]
pub struct Gateways {
    pub llm: Arc<dyn LanguageModelGateway>,
    pub vectors: Arc<dyn VectorRetrievalGateway>,
    pub store: Arc<dyn PersistenceGateway>,
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub models: ModelSelection,
    pub session: SessionConfig,
    pub retrieval: RetrievalConfig,
    pub limits: LimitsConfig,
}

impl From<&Settings> for EngineConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            models: settings.models.clone(),
            session: settings.session.clone(),
            retrieval: settings.retrieval.clone(),
            limits: settings.limits.clone(),
        }
    }
}

struct RequestTrace {
    session_id: String,
    user_id: Option<String>,
    stage: RequestStage,
}

impl RequestTrace {
    fn advance(&mut self, stage: RequestStage) {
        debug!(
            session_id = %self.session_id,
            from = self.stage.as_str(),
            to = stage.as_str(),
            "Request stage"
        );
        self.stage = stage;
    }
}

/// Entry point for chat turns and session administration.
pub struct RagOrchestrator {
    sessions: Arc<SessionMemoryManager>,
    store: Arc<dyn PersistenceGateway>,
    decomposer: QueryDecomposer,
    expander: MultiQueryExpander,
    retriever: ParallelRetriever,
    generator: ResponseGenerator,
    evaluator: ResponseEvaluator,
    limiters: Limiters,
    retrieval: RetrievalConfig,
    logger: ActivityLogger,
    reaper: Mutex<Option<SessionReaper>>,
}

impl RagOrchestrator {
    pub fn new(gateways: Gateways, config: EngineConfig, logger: ActivityLogger) -> Self {
        let limiters = Limiters::new(&config.limits, &config.retrieval);
        let models = config.models;

        let summarizer = Summarizer::new(
            gateways.llm.clone(),
            &models.summarization,
            limiters.clone(),
            &config.session,
        );
        let sessions = Arc::new(SessionMemoryManager::new(
            gateways.store.clone(),
            summarizer,
            config.session,
            limiters.call_timeout,
            logger.clone(),
        ));

        info!(
            decomposition = %models.decomposition,
            multiquery = %models.multiquery,
            generation = %models.generation,
            evaluation = %models.evaluation,
            summarization = %models.summarization,
            "RAG orchestrator initialized"
        );

        Self {
            sessions,
            store: gateways.store,
            decomposer: QueryDecomposer::new(
                gateways.llm.clone(),
                &models.decomposition,
                limiters.clone(),
                &config.retrieval,
            ),
            expander: MultiQueryExpander::new(
                gateways.llm.clone(),
                &models.multiquery,
                limiters.clone(),
                config.retrieval.fanout,
            ),
            retriever: ParallelRetriever::new(gateways.vectors, limiters.clone()),
            generator: ResponseGenerator::new(
                gateways.llm.clone(),
                &models.generation,
                limiters.clone(),
                &config.limits,
            ),
            evaluator: ResponseEvaluator::new(gateways.llm, &models.evaluation, limiters.clone()),
            limiters,
            retrieval: config.retrieval,
            logger,
            reaper: Mutex::new(None),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionMemoryManager> {
        &self.sessions
    }

    // ===== CHAT =====

    /// Answer one query. Missing ids are generated and returned.
    pub async fn handle_chat(&self, request: ChatRequest) -> ChatResult<ChatResponse> {
        let start = Instant::now();

        let session_id = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut trace = RequestTrace {
            session_id,
            user_id: request
                .user_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            stage: RequestStage::Received,
        };

        let result = self.run_pipeline(&mut trace, &request, start).await;

        match result {
            Ok(response) => {
                trace.advance(RequestStage::Done);
                Ok(response)
            }
            Err(err) => {
                let failed_stage = trace.stage;
                trace.advance(RequestStage::Error);
                self.log_failure(&trace, failed_stage, &err, start);
                Err(err)
            }
        }
    }

    async fn run_pipeline(
        &self,
        trace: &mut RequestTrace,
        request: &ChatRequest,
        start: Instant,
    ) -> ChatResult<ChatResponse> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(ChatError::InvalidRequest("query must not be empty".to_string()));
        }

        self.logger.log(
            ActivityLog::builder(&trace.session_id, ActivityType::RequestReceived)
                .user(trace.user_id.as_deref())
                .status(ActivityStatus::Info)
                .stage(RequestStage::Received.as_str())
                .message(query)
                .build(),
        );

        // CONTEXT_LOADED
        let memory = self
            .sessions
            .get_or_load(&trace.session_id, trace.user_id.as_deref())
            .await?;
        trace.user_id = Some(memory.user_id.clone());
        let target = self.resolve_target(request.vector_store.as_deref()).await?;
        trace.advance(RequestStage::ContextLoaded);

        // DECOMPOSED
        let sub_questions = self.decomposer.decompose(query).await;
        trace.advance(RequestStage::Decomposed);

        // EXPANDED
        let variant_sets = self.expander.expand_all(&sub_questions).await;
        let variants = dedup_normalized(variant_sets.iter().flatten().cloned().collect());
        trace.advance(RequestStage::Expanded);

        // RETRIEVED
        let retrieval = self
            .retriever
            .retrieve_all(&variants, &target, self.retrieval.top_k)
            .await?;
        if !retrieval.failures.is_empty() {
            self.logger.log(
                ActivityLog::builder(&trace.session_id, ActivityType::RetrievalError)
                    .user(trace.user_id.as_deref())
                    .status(ActivityStatus::Warning)
                    .stage(RequestStage::Retrieved.as_str())
                    .custom("failed_variants", retrieval.failures.len())
                    .custom("variants", variants.len())
                    .build(),
            );
        }
        trace.advance(RequestStage::Retrieved);

        // FUSED
        let fused = reciprocal_rank_fusion(&retrieval.ranked_lists(), self.retrieval.rrf_k);
        trace.advance(RequestStage::Fused);

        // CONTEXT_BUILT
        let context = build_context(&fused, self.retrieval.context_token_budget);
        trace.advance(RequestStage::ContextBuilt);

        // GENERATED
        let llm_start = Instant::now();
        let generated = self.generator.generate(query, &context, &memory).await?;
        let llm_ms = llm_start.elapsed().as_millis();
        trace.advance(RequestStage::Generated);

        // EVALUATED
        let evaluation = self
            .evaluator
            .evaluate(query, &generated.answer, &context)
            .await;
        if evaluation.degraded {
            self.logger.log(
                ActivityLog::builder(&trace.session_id, ActivityType::EvaluationFallback)
                    .user(trace.user_id.as_deref())
                    .status(ActivityStatus::Warning)
                    .stage(RequestStage::Evaluated.as_str())
                    .evaluation_score(evaluation.score)
                    .build(),
            );
        }
        trace.advance(RequestStage::Evaluated);

        // PERSISTED
        let processing_ms = start.elapsed().as_millis();
        let turn = NewTurn {
            user_text: query.to_string(),
            assistant_text: generated.answer.clone(),
            evaluation_score: evaluation.score,
            processing_time_ms: processing_ms.min(i64::MAX as u128) as i64,
        };
        // Spawned so a dropped request cannot interrupt the write
        let sessions = self.sessions.clone();
        let session_id = trace.session_id.clone();
        let appended = tokio::spawn(async move { sessions.append_turn(&session_id, turn).await })
            .await
            .map_err(|e| {
                error!(session_id = %trace.session_id, "Persist task failed: {}", e);
                ChatError::StorageUnavailable("failed to persist the conversation turn".to_string())
            })??;

        self.save_decomposition(trace, query, appended.user_seq(), &sub_questions, variant_sets)
            .await;
        trace.advance(RequestStage::Persisted);

        let processing_time = start.elapsed().as_secs_f64();
        self.logger.log(
            ActivityLog::builder(&trace.session_id, ActivityType::MessageSent)
                .user(trace.user_id.as_deref())
                .stage(RequestStage::Persisted.as_str())
                .response(&generated.answer)
                .evaluation_score(evaluation.score)
                .processing_time(start.elapsed().as_millis())
                .llm_duration(llm_ms)
                .retrieval_duration(retrieval.elapsed_ms)
                .token_count(appended.tail_tokens)
                .custom("sub_questions", sub_questions.len())
                .custom("variants", variants.len())
                .custom("fused", fused.len())
                .custom("context_chunks", context.len())
                .custom("summarized", appended.summarized)
                .build(),
        );

        info!(
            session_id = %trace.session_id,
            user_id = %memory.user_id,
            sub_questions = sub_questions.len(),
            variants = variants.len(),
            context_chunks = context.len(),
            score = evaluation.score,
            elapsed_ms = (processing_time * 1000.0) as u64,
            "Chat turn completed"
        );

        Ok(ChatResponse {
            response: generated.answer,
            session_id: trace.session_id.clone(),
            user_id: memory.user_id,
            suggested_questions: generated.suggested_questions,
            evaluation_score: evaluation.score,
            processing_time,
        })
    }

    async fn resolve_target(&self, requested: Option<&str>) -> ChatResult<RetrievalTarget> {
        let name = requested
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.retrieval.default_vector_store.as_str());

        let entry = tokio::time::timeout(self.limiters.call_timeout, self.store.get_vector_store(name))
            .await
            .map_err(|_| anyhow::anyhow!("registry lookup timed out"))
            .and_then(|r| r)
            .map_err(|e| {
                error!(vector_store = name, "Vector store registry lookup failed: {:#}", e);
                ChatError::StorageUnavailable("vector store registry is unavailable".to_string())
            })?
            .ok_or_else(|| ChatError::NotFound(format!("vector store '{}' not found", name)))?;

        let embedding_model = match entry.embedding_model_id {
            Some(id) => {
                match tokio::time::timeout(self.limiters.call_timeout, self.store.get_embedding_model(id)).await {
                    Ok(Ok(model)) => model.map(|m| m.name),
                    Ok(Err(e)) => {
                        warn!(vector_store = name, "Embedding model lookup failed, using default: {:#}", e);
                        None
                    }
                    Err(_) => {
                        warn!(vector_store = name, "Embedding model lookup timed out, using default");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(RetrievalTarget {
            store_name: entry.name,
            collection: entry.collection,
            embedding_model,
        })
    }

    async fn save_decomposition(
        &self,
        trace: &RequestTrace,
        query: &str,
        message_seq: Option<i64>,
        sub_questions: &[String],
        variants: Vec<Vec<String>>,
    ) {
        let record = DecompositionRecord {
            id: Uuid::new_v4(),
            session_id: trace.session_id.clone(),
            message_seq,
            original_query: query.to_string(),
            sub_questions: sub_questions.to_vec(),
            variants,
            created_at: Utc::now(),
        };

        match tokio::time::timeout(self.limiters.call_timeout, self.store.save_decomposition(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %trace.session_id, "Failed to save decomposition record: {:#}", e),
            Err(_) => warn!(session_id = %trace.session_id, "Saving decomposition record timed out"),
        }
    }

    fn log_failure(&self, trace: &RequestTrace, stage: RequestStage, err: &ChatError, start: Instant) {
        let kind = err.kind();
        if err.is_client_error() {
            warn!(
                session_id = %trace.session_id,
                user_id = trace.user_id.as_deref().unwrap_or("-"),
                stage = stage.as_str(),
                kind = kind.as_str(),
                "Chat request rejected: {}",
                err
            );
        } else {
            error!(
                session_id = %trace.session_id,
                user_id = trace.user_id.as_deref().unwrap_or("-"),
                stage = stage.as_str(),
                kind = kind.as_str(),
                "Chat request failed: {}",
                err
            );
        }

        let activity = match kind {
            ErrorKind::RetrievalUnavailable => ActivityType::RetrievalError,
            ErrorKind::GenerationFailed => ActivityType::LlmError,
            _ => ActivityType::ProcessingStage,
        };
        self.logger.log(
            ActivityLog::builder(&trace.session_id, activity)
                .user(trace.user_id.as_deref())
                .stage(stage.as_str())
                .processing_time(start.elapsed().as_millis())
                .error(err.message(), kind.as_str())
                .build(),
        );
    }

    // ===== SESSION ADMINISTRATION =====

    pub async fn summarize_now(&self, session_id: &str) -> ChatResult<String> {
        self.sessions.summarize_now(session_id).await
    }

    pub fn get_active_session_count(&self) -> usize {
        self.sessions.active_count()
    }

    /// Run an idle sweep immediately. Returns the number of evicted sessions.
    pub async fn cleanup_now(&self) -> usize {
        self.sessions.reap_idle().await
    }

    pub async fn session_history(&self, session_id: &str, limit: usize) -> ChatResult<Vec<ChatMessage>> {
        self.sessions.session_history(session_id, limit).await
    }

    pub async fn user_sessions(&self, user_id: &str) -> ChatResult<Vec<SessionRecord>> {
        self.sessions.user_sessions(user_id).await
    }

    pub async fn delete_session(&self, session_id: &str) -> ChatResult<bool> {
        self.sessions.delete_session(session_id).await
    }

    /// Start periodic idle cleanup. No-op when already running.
    pub fn start_reaper(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }
        let interval = self.sessions.config().cleanup_interval();
        *reaper = Some(SessionReaper::start(self.sessions.clone(), interval));
    }

    pub async fn stop_reaper(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
    }

    /// Stop the reaper, flush every cached session and drain the activity log.
    pub async fn shutdown(&self) -> usize {
        self.stop_reaper().await;
        let flushed = self.sessions.flush_all().await;
        self.logger.shutdown().await;
        flushed
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_sessions: self.sessions.active_count(),
            cached_slots: self.sessions.stats().slots,
            activity_queue_len: self.logger.queue_len(),
        }
    }
}
