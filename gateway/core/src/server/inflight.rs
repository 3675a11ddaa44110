//! In-flight tracking
//!
//! Remembers which `request_id`s and call keys are executing right now so
//! duplicates are detected and identical calls run at most once at a time.
//!
//! ```text
//! claim(request_id, call_key)
//!   request_id already running ─► DuplicateRequest
//!   call_key already running ───► Follower(wait for the leader to finish)
//!   otherwise ──────────────────► Leader(guard; dropping it wakes followers)
//! ```
//!
//! Both sets live under one mutex so the two checks are a single atomic
//! decision.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Default)]
struct State {
    request_ids: HashSet<String>,
    keys: HashMap<String, watch::Sender<()>>,
}

/// Outcome of [`InFlightTable::claim`]
pub enum Claim {
    /// This `request_id` is already executing
    DuplicateRequest,
    /// Another request is executing the same call key
    Follower {
        /// Resolves once the leader's guard is dropped
        done: watch::Receiver<()>,
        /// Holds this request's id as in-flight while it waits
        guard: InFlightGuard,
    },
    /// Caller executes; results must be stored before the guard drops
    Leader(InFlightGuard),
}

/// Running requests and call keys
#[derive(Default)]
pub struct InFlightTable {
    state: Mutex<State>,
}

impl InFlightTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `request_id` for `call_key`
    pub fn claim(self: &Arc<Self>, request_id: &str, call_key: &str) -> Claim {
        let mut state = self.state.lock();
        if state.request_ids.contains(request_id) {
            return Claim::DuplicateRequest;
        }
        state.request_ids.insert(request_id.to_string());

        if let Some(leader) = state.keys.get(call_key) {
            let done = leader.subscribe();
            return Claim::Follower {
                done,
                guard: InFlightGuard {
                    table: Arc::clone(self),
                    request_id: request_id.to_string(),
                    call_key: None,
                },
            };
        }

        let (tx, _rx) = watch::channel(());
        state.keys.insert(call_key.to_string(), tx);
        Claim::Leader(InFlightGuard {
            table: Arc::clone(self),
            request_id: request_id.to_string(),
            call_key: Some(call_key.to_string()),
        })
    }

    /// Whether `request_id` is executing or waiting
    pub fn contains_request(&self, request_id: &str) -> bool {
        self.state.lock().request_ids.contains(request_id)
    }

    /// Distinct call keys executing
    pub fn executing(&self) -> usize {
        self.state.lock().keys.len()
    }
}

/// Releases a claim on drop
pub struct InFlightGuard {
    table: Arc<InFlightTable>,
    request_id: String,
    call_key: Option<String>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let leader = {
            let mut state = self.table.state.lock();
            state.request_ids.remove(&self.request_id);
            self.call_key.as_ref().and_then(|key| state.keys.remove(key))
        };
        // Sender dropped outside the lock; followers observe the close
        drop(leader);
    }
}
