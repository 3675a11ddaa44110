//! Session Manager
//!
//! One [`Session`] per authenticated connection. The id is always minted
//! server-side; a client-supplied `session_id` is never trusted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::server::admission::PermitPool;

/// A live, authenticated connection
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    permits: Arc<PermitPool>,
    closed: AtomicBool,
}

impl Session {
    /// Server-issued id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Per-session permit pool
    pub fn permits(&self) -> &Arc<PermitPool> {
        &self.permits
    }

    /// Calls currently holding a session permit
    pub fn inflight(&self) -> usize {
        self.permits.in_use()
    }

    /// Session cap
    pub fn max_inflight(&self) -> usize {
        self.permits.capacity()
    }

    /// Whether the connection has gone
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Registry of live sessions
pub struct SessionManager {
    sessions: DashMap<String, Arc<Session>>,
    max_inflight: usize,
}

impl SessionManager {
    /// Sessions will each allow `max_inflight` concurrent calls
    pub fn new(max_inflight: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_inflight,
        }
    }

    /// Mint and register a new session
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            permits: Arc::new(PermitPool::new(self.max_inflight)),
            closed: AtomicBool::new(false),
        });
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        tracing::debug!(session_id = %session.id, "Session created");
        session
    }

    /// Look up a live session
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Mark closed and forget
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.closed.store(true, Ordering::Release);
        tracing::debug!(session_id = %id, inflight = session.inflight(), "Session removed");
        Some(session)
    }

    /// Live sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Session permits held across all sessions
    pub fn total_inflight(&self) -> usize {
        self.sessions.iter().map(|s| s.inflight()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_get_unique_server_ids() {
        let manager = SessionManager::new(2);
        let a = manager.create();
        let b = manager.create();
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.count(), 2);
        assert_eq!(a.max_inflight(), 2);
        assert!(Uuid::parse_str(a.id()).is_ok());
    }

    #[test]
    fn test_remove_marks_closed() {
        let manager = SessionManager::new(1);
        let session = manager.create();
        let permit = session.permits().try_acquire().unwrap();
        assert_eq!(manager.total_inflight(), 1);

        let removed = manager.remove(session.id()).unwrap();
        assert!(removed.is_closed());
        assert!(manager.get(session.id()).is_none());
        assert_eq!(manager.count(), 0);

        // Outstanding permits still return to the pool
        drop(permit);
        assert_eq!(session.inflight(), 0);
        assert!(manager.remove(session.id()).is_none());
    }
}
