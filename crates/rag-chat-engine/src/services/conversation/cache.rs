use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::types::SlotState;
use crate::models::SessionId;

pub type SlotHandle = Arc<Mutex<SlotState>>;

/// Process-wide map of session slots.
///
/// At most one slot exists per session id. The map lock is only held to
/// find or insert a slot, never across an await.
#[derive(Clone)]
pub struct SessionCache {
    slots: Arc<DashMap<SessionId, SlotHandle>>,
    live: Arc<AtomicUsize>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub live_sessions: usize,
    pub slots: usize,
}

impl SessionCache {
    pub fn new() -> Self {
        info!("Initializing session cache with DashMap");
        Self {
            slots: Arc::new(DashMap::new()),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Existing slot for `session_id`, or a fresh `Vacant` one.
    pub fn slot(&self, session_id: &str) -> SlotHandle {
        if let Some(existing) = self.slots.get(session_id) {
            return existing.value().clone();
        }
        self.slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SlotState::Vacant)))
            .value()
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<SlotHandle> {
        self.slots.get(session_id).map(|e| e.value().clone())
    }

    /// Remove the slot only if it is still `handle`.
    pub fn remove_if_same(&self, session_id: &str, handle: &SlotHandle) -> bool {
        self.slots
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Point-in-time copy of every slot.
    pub fn snapshot(&self) -> Vec<(SessionId, SlotHandle)> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn mark_live(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_gone(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    /// Sessions currently held in memory.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            live_sessions: self.live_count(),
            slots: self.slots.len(),
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_shared_per_id() {
        let cache = SessionCache::new();
        let a = cache.slot("s1");
        let b = cache.slot("s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &cache.slot("s2")));
    }

    #[test]
    fn test_remove_if_same_ignores_replaced_slot() {
        let cache = SessionCache::new();
        let old = cache.slot("s1");
        assert!(cache.remove_if_same("s1", &old));

        let new = cache.slot("s1");
        assert!(!cache.remove_if_same("s1", &old));
        assert!(cache.get("s1").is_some_and(|h| Arc::ptr_eq(&h, &new)));
    }

    #[test]
    fn test_live_counter_never_underflows() {
        let cache = SessionCache::new();
        cache.mark_gone();
        assert_eq!(cache.live_count(), 0);
        cache.mark_live();
        cache.mark_live();
        cache.mark_gone();
        assert_eq!(cache.live_count(), 1);
    }
}
