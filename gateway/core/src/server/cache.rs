//! Result cache
//!
//! Completed `call_tool_res` payloads keyed by `request_id` and by call key,
//! replayable until their TTL passes. One mutex guards the whole map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::protocol::ServerMessage;

struct Entry {
    seq: u64,
    stored_at: Instant,
    message: ServerMessage,
}

/// TTL cache of completed responses
pub struct ResultCache {
    entries: Mutex<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    ttl: Duration,
    max_entries: usize,
}

impl ResultCache {
    /// Entries live for `ttl`; at most `max_entries` are kept
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Fresh entry for `key`
    pub fn get(&self, key: &str) -> Option<ServerMessage> {
        let mut entries = self.entries.lock();
        let expired = entries.get(key)?.stored_at.elapsed() >= self.ttl;
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.message.clone())
    }

    /// Store `message` under `key`, evicting the oldest entry when full
    pub fn insert(&self, key: impl Into<String>, message: ServerMessage) {
        let key = key.into();
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                stored_at: Instant::now(),
                message,
            },
        );
    }

    /// Drop expired entries, returning how many went
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Entries held, expired or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> ServerMessage {
        ServerMessage::Error {
            message: id.to_string(),
        }
    }

    #[test]
    fn test_get_within_ttl() {
        let cache = ResultCache::new(Duration::from_secs(60), 8);
        cache.insert("r1", message("a"));
        assert_eq!(cache.get("r1"), Some(message("a")));
        assert_eq!(cache.get("r2"), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_not_served() {
        let cache = ResultCache::new(Duration::from_millis(20), 8);
        cache.insert("r1", message("a"));
        cache.insert("r2", message("b"));
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get("r1"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oldest_evicted_when_full() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.insert("a", message("a"));
        cache.insert("b", message("b"));
        cache.insert("c", message("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());

        // Overwriting an existing key evicts nothing
        cache.insert("c", message("c2"));
        assert!(cache.get("b").is_some());
    }
}
