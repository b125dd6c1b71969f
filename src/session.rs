//! Per-session state: owned conversation memory plus the lock that keeps
//! one generation in flight per session.
//!
//! Session state is always looked up by id through a [`SessionStore`] and
//! never lives in process-wide globals, so concurrent sessions cannot leak
//! turns into each other.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::memory::ConversationMemory;

/// State owned by one active RAG session.
///
/// The memory sits behind an async mutex that doubles as the session's
/// serialization point: the orchestrator holds it for the whole
/// ask-retrieve-generate cycle, so a second question on the same session
/// queues behind the first and memory turns never interleave.
pub struct Session {
    memory: tokio::sync::Mutex<ConversationMemory>,
}

impl Session {
    fn new(memory_capacity: usize) -> Self {
        Self {
            memory: tokio::sync::Mutex::new(ConversationMemory::new(memory_capacity)),
        }
    }

    /// Lock this session's memory, queueing behind any in-flight question.
    pub async fn lock_memory(&self) -> tokio::sync::MutexGuard<'_, ConversationMemory> {
        self.memory.lock().await
    }
}

/// Registry of live sessions, keyed by caller-chosen session id.
pub struct SessionStore {
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
    memory_capacity: usize,
}

impl SessionStore {
    /// A store whose sessions hold at most `memory_capacity` turns each.
    #[must_use]
    pub fn new(memory_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            memory_capacity,
        }
    }

    /// Fetch the session for `id`, creating an empty one on first use.
    #[must_use]
    pub fn session(&self, id: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(id) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write();
        // Racing creators settle on whichever entry landed first.
        Arc::clone(
            sessions
                .entry(id.to_owned())
                .or_insert_with(|| Arc::new(Session::new(self.memory_capacity))),
        )
    }

    /// Drop the session for `id`. The next question under this id starts
    /// with empty memory. Returns whether a session existed.
    pub fn clear(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            debug!(session = id, "cleared session");
        }
        removed
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationTurn;

    #[tokio::test]
    async fn same_id_returns_same_session() {
        let store = SessionStore::new(10);
        let a = store.session("s1");
        let b = store.session("s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = SessionStore::new(10);
        {
            let session = store.session("s1");
            let mut memory = session.lock_memory().await;
            memory.append(ConversationTurn::user("only in s1"));
        }
        let other = store.session("s2");
        assert!(other.lock_memory().await.is_empty());
    }

    #[tokio::test]
    async fn clear_starts_fresh() {
        let store = SessionStore::new(10);
        {
            let session = store.session("s1");
            session
                .lock_memory()
                .await
                .append(ConversationTurn::user("hello"));
        }
        assert!(store.clear("s1"));
        assert!(!store.clear("s1"));
        assert!(store.session("s1").lock_memory().await.is_empty());
    }
}
