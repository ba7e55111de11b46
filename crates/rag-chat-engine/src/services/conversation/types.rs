use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

use crate::models::{ChatMessage, SessionId, UserId};
use crate::utils::token_estimator::estimate_tokens;

/// Lifecycle of a session as seen by the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created in this process, nothing loaded from the store
    ActiveInMemory,
    /// Rebuilt from persisted summary and messages
    HydratedFromStore,
    /// Flushed and dropped from memory; rehydrates on next access
    Evicted,
}

/// In-memory conversation state.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub state: SessionState,

    /// Messages held in memory, ascending by seq: the most recent window plus
    /// every message not yet folded into `summary`
    pub messages: Vec<ChatMessage>,

    /// Rolling summary of every message with `seq <= summarized_through`
    pub summary: Option<String>,
    pub summarized_through: i64,

    /// Token estimate of the unsummarized tail
    pub tail_tokens: usize,

    /// Summary progress not yet written to the store
    pub pending_flush: bool,

    pub last_activity: Instant,
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self {
            session_id,
            user_id,
            state: SessionState::ActiveInMemory,
            messages: Vec::new(),
            summary: None,
            summarized_through: 0,
            tail_tokens: 0,
            pending_flush: false,
            last_activity: Instant::now(),
            last_active_at: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_active_at = Utc::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Messages not yet folded into the summary.
    pub fn tail(&self) -> &[ChatMessage] {
        let start = self
            .messages
            .partition_point(|m| m.seq <= self.summarized_through);
        &self.messages[start..]
    }

    pub fn recompute_tail(&mut self) {
        self.tail_tokens = self.tail().iter().map(|m| estimate_tokens(&m.content)).sum();
    }

    /// Drop summarized messages outside the most recent `window`.
    pub fn trim_window(&mut self, window: usize) {
        let len = self.messages.len();
        let through = self.summarized_through;
        let mut idx = 0usize;
        self.messages.retain(|m| {
            let keep = m.seq > through || idx + window >= len;
            idx += 1;
            keep
        });
    }

    pub fn context(&self) -> SessionContext {
        SessionContext {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            state: self.state,
            summary: self.summary.clone(),
            history: self.tail().to_vec(),
            tail_tokens: self.tail_tokens,
        }
    }
}

/// Snapshot handed to the pipeline for prompt building.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub state: SessionState,
    pub summary: Option<String>,
    /// Unsummarized messages, ascending
    pub history: Vec<ChatMessage>,
    pub tail_tokens: usize,
}

/// One completed exchange to append.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub user_text: String,
    pub assistant_text: String,
    pub evaluation_score: f32,
    pub processing_time_ms: i64,
}

#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// The two persisted messages, user first
    pub messages: Vec<ChatMessage>,
    pub summarized: bool,
    pub summarization_failed: bool,
    pub tail_tokens: usize,
}

impl AppendOutcome {
    pub fn user_seq(&self) -> Option<i64> {
        self.messages.first().map(|m| m.seq)
    }
}

/// Slot held in the session map. The per-slot async mutex serializes every
/// access to one session.
#[derive(Debug)]
pub enum SlotState {
    /// Reserved, hydration not finished
    Vacant,
    Live(Session),
    /// Removed from the map; holders must look the id up again
    Evicted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn msg(seq: i64, words: usize) -> ChatMessage {
        ChatMessage {
            session_id: "s".into(),
            seq,
            role: if seq % 2 == 1 { Role::User } else { Role::Assistant },
            content: "w ".repeat(words),
            created_at: Utc::now(),
            evaluation_score: None,
            processing_time_ms: None,
        }
    }

    #[test]
    fn test_tail_respects_watermark() {
        let mut session = Session::new("s".into(), "u".into());
        session.messages = (1..=4).map(|s| msg(s, 10)).collect();
        session.summarized_through = 2;
        session.recompute_tail();

        let seqs: Vec<_> = session.tail().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(session.tail_tokens, 2 * 18);
    }

    #[test]
    fn test_trim_window_keeps_unsummarized() {
        let mut session = Session::new("s".into(), "u".into());
        session.messages = (1..=10).map(|s| msg(s, 1)).collect();
        session.summarized_through = 8;

        session.trim_window(3);
        let seqs: Vec<_> = session.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);

        session.summarized_through = 2;
        session.messages = (1..=10).map(|s| msg(s, 1)).collect();
        session.trim_window(3);
        assert_eq!(session.messages.first().map(|m| m.seq), Some(3));
    }
}
