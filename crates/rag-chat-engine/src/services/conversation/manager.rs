use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cache::{CacheStats, SessionCache, SlotHandle};
use super::summarizer::{Summarizer, SummaryMode};
use super::types::{AppendOutcome, NewTurn, Session, SessionContext, SessionState, SlotState};
use crate::config::SessionConfig;
use crate::database::{NewMessage, SessionRecord};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::ChatMessage;
use crate::services::gateways::PersistenceGateway;
use crate::utils::{ChatError, ChatResult};

/// How a missing slot is filled.
#[derive(Debug, Clone, Copy)]
enum LoadMode<'a> {
    /// Hydrate, or create when the store has no such session.
    /// `Some(owner)` must match the owner of an existing session.
    Create { owner: Option<&'a str> },
    /// Hydrate only; `NotFound` when the store has no such session
    Existing,
}

#[derive(Debug, Default, Clone, Copy)]
struct SummaryPass {
    folded: usize,
    failed: bool,
}

fn live_session(slot: &mut SlotState) -> ChatResult<&mut Session> {
    match slot {
        SlotState::Live(session) => Ok(session),
        _ => Err(ChatError::StorageUnavailable(
            "session is not loaded".to_string(),
        )),
    }
}

fn session_not_found(session_id: &str) -> ChatError {
    ChatError::NotFound(format!("session {} not found", session_id))
}

/// Owns every in-memory session.
///
/// Access to one session is serialized by its slot mutex; different sessions
/// proceed concurrently. Writes go to the store before memory is mutated.
pub struct SessionMemoryManager {
    cache: SessionCache,
    store: Arc<dyn PersistenceGateway>,
    summarizer: Summarizer,
    config: SessionConfig,
    call_timeout: Duration,
    logger: ActivityLogger,
}

impl SessionMemoryManager {
    pub fn new(
        store: Arc<dyn PersistenceGateway>,
        summarizer: Summarizer,
        config: SessionConfig,
        call_timeout: Duration,
        logger: ActivityLogger,
    ) -> Self {
        info!(
            timeout_s = config.timeout_seconds,
            threshold = config.summarization_threshold,
            window = config.history_window,
            "Session memory manager initialized"
        );
        Self {
            cache: SessionCache::new(),
            store,
            summarizer,
            config,
            call_timeout,
            logger,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn store_call<T, F>(&self, op: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("store call {} timed out after {:?}", op, self.call_timeout))?
    }

    fn storage_error(&self, session_id: &str, op: &'static str, err: anyhow::Error) -> ChatError {
        error!(session_id, stage = "CONTEXT_LOADED", op, "Session storage failure: {:#}", err);
        ChatError::StorageUnavailable("session storage is unavailable".to_string())
    }

    // ===== SLOT MANAGEMENT =====

    /// Lock the session's slot, hydrating it first when needed.
    /// On success the slot is `Live`.
    async fn lock_session(
        &self,
        session_id: &str,
        mode: LoadMode<'_>,
    ) -> ChatResult<OwnedMutexGuard<SlotState>> {
        loop {
            let handle = self.cache.slot(session_id);
            let mut guard = handle.clone().lock_owned().await;

            match &*guard {
                SlotState::Live(session) => {
                    if let LoadMode::Create { owner: Some(owner) } = mode {
                        if session.user_id != owner {
                            warn!(session_id, user_id = owner, "Session owner mismatch");
                            return Err(session_not_found(session_id));
                        }
                    }
                    return Ok(guard);
                }
                SlotState::Evicted => {
                    // Slot left the map while we waited; look it up again
                    drop(guard);
                    tokio::task::yield_now().await;
                }
                SlotState::Vacant => match self.hydrate(session_id, mode).await {
                    Ok(session) => {
                        *guard = SlotState::Live(session);
                        self.cache.mark_live();
                        return Ok(guard);
                    }
                    Err(e) => {
                        *guard = SlotState::Evicted;
                        self.cache.remove_if_same(session_id, &handle);
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn hydrate(&self, session_id: &str, mode: LoadMode<'_>) -> ChatResult<Session> {
        let record = self
            .store_call("get_session", self.store.get_session(session_id))
            .await
            .map_err(|e| self.storage_error(session_id, "get_session", e))?;

        match record {
            Some(record) => self.hydrate_existing(record, mode).await,
            None => match mode {
                LoadMode::Existing => Err(session_not_found(session_id)),
                LoadMode::Create { owner } => self.create(session_id, owner).await,
            },
        }
    }

    async fn hydrate_existing(&self, record: SessionRecord, mode: LoadMode<'_>) -> ChatResult<Session> {
        let session_id = record.session_id.as_str();
        if let LoadMode::Create { owner: Some(owner) } = mode {
            if record.user_id != owner {
                warn!(session_id, user_id = owner, "Session owner mismatch on hydration");
                return Err(session_not_found(session_id));
            }
        }

        let recent = self
            .store_call(
                "recent_messages",
                self.store.recent_messages(session_id, self.config.history_window),
            )
            .await
            .map_err(|e| self.storage_error(session_id, "recent_messages", e))?;
        let unsummarized = self
            .store_call(
                "messages_after",
                self.store.messages_after(session_id, record.summarized_through),
            )
            .await
            .map_err(|e| self.storage_error(session_id, "messages_after", e))?;
        self.store_call(
            "upsert_session",
            self.store.upsert_session(session_id, &record.user_id),
        )
        .await
        .map_err(|e| self.storage_error(session_id, "upsert_session", e))?;

        let mut merged: BTreeMap<i64, ChatMessage> = BTreeMap::new();
        for message in recent.into_iter().chain(unsummarized) {
            merged.entry(message.seq).or_insert(message);
        }

        let mut session = Session::new(record.session_id.clone(), record.user_id.clone());
        session.state = SessionState::HydratedFromStore;
        session.summary = record.summary;
        session.summarized_through = record.summarized_through;
        session.messages = merged.into_values().collect();
        session.recompute_tail();

        info!(
            session_id,
            messages = session.messages.len(),
            tail_tokens = session.tail_tokens,
            "Session hydrated from store"
        );
        self.logger.log(
            ActivityLog::builder(session_id, ActivityType::SessionHydrated)
                .user(Some(&session.user_id))
                .token_count(session.tail_tokens)
                .custom("messages", session.messages.len())
                .build(),
        );
        Ok(session)
    }

    async fn create(&self, session_id: &str, owner: Option<&str>) -> ChatResult<Session> {
        let user_id = owner
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.store_call("upsert_user", self.store.upsert_user(&user_id))
            .await
            .map_err(|e| self.storage_error(session_id, "upsert_user", e))?;
        let record = self
            .store_call("upsert_session", self.store.upsert_session(session_id, &user_id))
            .await
            .map_err(|e| self.storage_error(session_id, "upsert_session", e))?;

        if record.user_id != user_id {
            // Created concurrently by another owner
            return Err(session_not_found(session_id));
        }

        debug!(session_id, user_id = %user_id, "New session created");
        self.logger.log(
            ActivityLog::builder(session_id, ActivityType::SessionCreated)
                .user(Some(&user_id))
                .build(),
        );
        Ok(Session::new(session_id.to_string(), user_id))
    }

    // ===== PUBLIC OPERATIONS =====

    /// Cached session or hydrate/create it. `NotFound` only on owner mismatch.
    /// A new session without `user_id` gets a generated owner.
    pub async fn get_or_load(&self, session_id: &str, user_id: Option<&str>) -> ChatResult<SessionContext> {
        let mut guard = self
            .lock_session(session_id, LoadMode::Create { owner: user_id })
            .await?;
        let session = live_session(&mut guard)?;
        session.touch();
        Ok(session.context())
    }

    /// Persist both messages of a turn, then update memory and summarize when
    /// the tail is over the threshold.
    pub async fn append_turn(&self, session_id: &str, turn: NewTurn) -> ChatResult<AppendOutcome> {
        let mut guard = self.lock_session(session_id, LoadMode::Existing).await?;
        let session = live_session(&mut guard)?;

        let new_messages = [
            NewMessage::user(turn.user_text),
            NewMessage::assistant(turn.assistant_text, turn.evaluation_score, turn.processing_time_ms),
        ];
        let persisted = self
            .store_call("append_messages", self.store.append_messages(session_id, &new_messages))
            .await
            .map_err(|e| self.storage_error(session_id, "append_messages", e))?;

        session.messages.extend(persisted.iter().cloned());
        session.messages.sort_by_key(|m| m.seq);
        session.messages.dedup_by_key(|m| m.seq);
        session.recompute_tail();
        session.touch();

        let mut outcome = AppendOutcome {
            messages: persisted,
            summarized: false,
            summarization_failed: false,
            tail_tokens: session.tail_tokens,
        };

        if session.tail_tokens > self.config.summarization_threshold {
            let pass = self.summarize_locked(session, SummaryMode::Threshold).await;
            outcome.summarized = pass.folded > 0;
            outcome.summarization_failed = pass.failed;
        }

        session.trim_window(self.config.history_window);
        outcome.tail_tokens = session.tail_tokens;
        Ok(outcome)
    }

    /// Fold the oldest messages until the tail is within the threshold.
    /// Returns the current summary.
    pub async fn summarize(&self, session_id: &str) -> ChatResult<Option<String>> {
        let mut guard = self.lock_session(session_id, LoadMode::Existing).await?;
        let session = live_session(&mut guard)?;
        self.summarize_locked(session, SummaryMode::Threshold).await;
        Ok(session.summary.clone())
    }

    /// Fold every unsummarized message but the newest and return the summary.
    pub async fn summarize_now(&self, session_id: &str) -> ChatResult<String> {
        let mut guard = self.lock_session(session_id, LoadMode::Existing).await?;
        let session = live_session(&mut guard)?;
        session.touch();
        self.summarize_locked(session, SummaryMode::Force).await;
        session.trim_window(self.config.history_window);
        Ok(session.summary.clone().unwrap_or_default())
    }

    async fn summarize_locked(&self, session: &mut Session, mode: SummaryMode) -> SummaryPass {
        let mut pass = SummaryPass::default();
        let tokens_before = session.tail_tokens;

        loop {
            let done = match mode {
                SummaryMode::Threshold => {
                    session.tail_tokens <= self.config.summarization_threshold
                        || session.tail().len() <= 1
                }
                SummaryMode::Force => session.tail().len() <= 1,
            };
            if done {
                break;
            }

            let count = self
                .summarizer
                .select_batch(session.tail(), session.summary.as_deref());
            if count == 0 {
                break;
            }
            let batch = session.tail()[..count].to_vec();

            let result = self.summarizer.fold(session.summary.as_deref(), &batch).await;
            match result {
                Ok(summary) => {
                    session.summary = Some(summary);
                    session.summarized_through = batch[count - 1].seq;
                    session.recompute_tail();
                    pass.folded += count;
                }
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        user_id = %session.user_id,
                        stage = "PERSISTED",
                        "Summarization failed, keeping unsummarized tail: {:#}",
                        e
                    );
                    self.logger.log(
                        ActivityLog::builder(&session.session_id, ActivityType::SummarizationFailed)
                            .user(Some(&session.user_id))
                            .token_count(session.tail_tokens)
                            .error(e.to_string(), "SummarizationFailed")
                            .build(),
                    );
                    pass.failed = true;
                    break;
                }
            }
        }

        if pass.folded > 0 {
            session.pending_flush = true;
            self.persist_summary(session).await;

            info!(
                session_id = %session.session_id,
                folded = pass.folded,
                tokens_before,
                tokens_after = session.tail_tokens,
                "Summarization applied"
            );
            self.logger.log(
                ActivityLog::builder(&session.session_id, ActivityType::SummarizationApplied)
                    .user(Some(&session.user_id))
                    .token_count(session.tail_tokens)
                    .custom("folded", pass.folded)
                    .custom("tokens_before", tokens_before)
                    .custom("summarized_through", session.summarized_through)
                    .build(),
            );
        }
        pass
    }

    /// Write summary and watermark; leaves `pending_flush` set on failure.
    async fn persist_summary(&self, session: &mut Session) -> bool {
        let Some(summary) = session.summary.as_deref() else {
            session.pending_flush = false;
            return true;
        };

        let saved = self
            .store_call(
                "save_summary",
                self.store
                    .save_summary(&session.session_id, summary, session.summarized_through),
            )
            .await;

        match saved {
            Ok(()) => {
                session.pending_flush = false;
                true
            }
            Err(e) => {
                warn!(session_id = %session.session_id, "Failed to persist summary, will retry on flush: {:#}", e);
                false
            }
        }
    }

    async fn flush_session(&self, session: &mut Session) -> ChatResult<()> {
        if session.pending_flush && !self.persist_summary(session).await {
            return Err(ChatError::StorageUnavailable(
                "failed to flush session summary".to_string(),
            ));
        }

        self.store_call(
            "mark_session_inactive",
            self.store
                .mark_session_inactive(&session.session_id, session.last_active_at),
        )
        .await
        .map_err(|e| self.storage_error(&session.session_id, "mark_session_inactive", e))
    }

    /// Flush and drop a locked slot. Returns whether a live session was evicted.
    async fn evict_locked(
        &self,
        session_id: &str,
        handle: &SlotHandle,
        slot: &mut SlotState,
        reason: &'static str,
    ) -> ChatResult<bool> {
        let was_live = match slot {
            SlotState::Live(session) => {
                self.flush_session(session).await?;
                session.state = SessionState::Evicted;
                self.logger.log(
                    ActivityLog::builder(session_id, ActivityType::SessionEvicted)
                        .user(Some(&session.user_id))
                        .custom("reason", reason)
                        .build(),
                );
                true
            }
            _ => false,
        };

        *slot = SlotState::Evicted;
        self.cache.remove_if_same(session_id, handle);
        if was_live {
            self.cache.mark_gone();
        }
        Ok(was_live)
    }

    /// Evict sessions idle longer than the configured timeout. Busy sessions
    /// are skipped; a second call with no activity in between is a no-op.
    pub async fn reap_idle(&self) -> usize {
        let timeout = self.config.timeout();
        let now = Instant::now();
        let mut evicted = 0;

        for (session_id, handle) in self.cache.snapshot() {
            let Ok(mut guard) = handle.clone().try_lock_owned() else {
                continue;
            };

            let reap = match &*guard {
                SlotState::Live(session) => session.idle_for(now) > timeout,
                // abandoned hydration
                SlotState::Vacant => true,
                SlotState::Evicted => false,
            };
            if !reap {
                continue;
            }

            match self.evict_locked(&session_id, &handle, &mut guard, "idle").await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session_id, "Keeping idle session, flush failed: {}", e),
            }
        }

        if evicted > 0 {
            info!(evicted, active = self.active_count(), "Reaped idle sessions");
        }
        evicted
    }

    /// Flush and evict every session. Used on shutdown.
    pub async fn flush_all(&self) -> usize {
        let mut flushed = 0;
        for (session_id, handle) in self.cache.snapshot() {
            let mut guard = handle.clone().lock_owned().await;
            match self.evict_locked(&session_id, &handle, &mut guard, "shutdown").await {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => error!(session_id = %session_id, "Failed to flush session on shutdown: {}", e),
            }
        }
        info!(flushed, "Flushed all sessions");
        flushed
    }

    /// Remove the session from memory and the store. Returns false when the
    /// store had no such session.
    pub async fn delete_session(&self, session_id: &str) -> ChatResult<bool> {
        let locked = match self.cache.get(session_id) {
            Some(handle) => {
                let guard = handle.clone().lock_owned().await;
                Some((handle, guard))
            }
            None => None,
        };

        let deleted = self
            .store_call("delete_session", self.store.delete_session(session_id))
            .await
            .map_err(|e| self.storage_error(session_id, "delete_session", e))?;

        if let Some((handle, mut guard)) = locked {
            let was_live = matches!(&*guard, SlotState::Live(_));
            *guard = SlotState::Evicted;
            self.cache.remove_if_same(session_id, &handle);
            if was_live {
                self.cache.mark_gone();
            }
        }

        info!(session_id, deleted, "Session deleted");
        self.logger.log(
            ActivityLog::builder(session_id, ActivityType::SessionDeleted)
                .status(if deleted { ActivityStatus::Success } else { ActivityStatus::Warning })
                .build(),
        );
        Ok(deleted)
    }

    /// Most recent `limit` persisted messages, ascending.
    pub async fn session_history(&self, session_id: &str, limit: usize) -> ChatResult<Vec<ChatMessage>> {
        let exists = self
            .store_call("get_session", self.store.get_session(session_id))
            .await
            .map_err(|e| self.storage_error(session_id, "get_session", e))?;
        if exists.is_none() {
            return Err(session_not_found(session_id));
        }

        self.store_call("recent_messages", self.store.recent_messages(session_id, limit))
            .await
            .map_err(|e| self.storage_error(session_id, "recent_messages", e))
    }

    pub async fn user_sessions(&self, user_id: &str) -> ChatResult<Vec<SessionRecord>> {
        self.store_call("list_user_sessions", self.store.list_user_sessions(user_id))
            .await
            .map_err(|e| {
                error!(user_id, "Failed to list user sessions: {:#}", e);
                ChatError::StorageUnavailable("session storage is unavailable".to_string())
            })
    }

    /// Sessions held in memory. No side effects.
    pub fn active_count(&self) -> usize {
        self.cache.live_count()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
