//! Conversation memory management module
//!
//! Keeps active sessions in memory with write-through persistence:
//! - Per-session slots in a DashMap, each behind an async mutex
//! - Recursive summarization against a per-session watermark
//! - Periodic eviction of idle sessions

mod cache;
pub mod manager;
pub mod reaper;
pub mod summarizer;
pub mod types;

pub use cache::{CacheStats, SessionCache};
pub use manager::SessionMemoryManager;
pub use reaper::SessionReaper;
pub use summarizer::{Summarizer, SummaryMode};
pub use types::{AppendOutcome, NewTurn, Session, SessionContext, SessionState};
