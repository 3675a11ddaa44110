//! Admission Control
//!
//! Non-blocking permit pools gating `call_tool` at three levels. A request
//! takes a global permit, then a provider permit (when a provider was
//! resolved), then a session permit. Any miss releases what was already
//! taken and fails immediately with `OVER_CAPACITY`; nothing queues.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DispatchConfig;

// ============================================================================
// Permit Pool
// ============================================================================

/// Fixed-size pool of interchangeable permits with a CAS fast path
#[derive(Debug)]
pub struct PermitPool {
    capacity: usize,
    available: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PermitPool {
    /// Create a pool of `capacity` permits
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: AtomicUsize::new(capacity),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Total permits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Take a permit if one is free right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let mut current = self.available.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return None;
            }
            match self
                .available
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return Some(Permit {
                        pool: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Lifetime acquire/release counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            available: self.available(),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    fn release(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// A held permit, returned to its pool on drop
#[derive(Debug)]
pub struct Permit {
    pool: Arc<PermitPool>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

/// Counters for one pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total permits
    pub capacity: usize,
    /// Free now
    pub available: usize,
    /// Lifetime acquisitions
    pub acquired: u64,
    /// Lifetime releases
    pub released: u64,
}

// ============================================================================
// Admission Controller
// ============================================================================

/// Which level rejected a request
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Process-wide cap reached
    #[error("global capacity exhausted")]
    Global,
    /// Provider cap reached
    #[error("provider '{0}' at capacity")]
    Provider(String),
    /// Session cap reached
    #[error("session at capacity")]
    Session,
}

/// Permits held by one admitted call
///
/// Fields drop in declaration order, so release runs session → provider →
/// global, the reverse of acquisition.
#[derive(Debug)]
pub struct AdmissionTicket {
    _session: Permit,
    _provider: Option<Permit>,
    _global: Permit,
}

/// Capacity figures reported by `health`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Global cap
    pub global: usize,
    /// Default per-provider cap
    pub provider: usize,
    /// Per-session cap
    pub session: usize,
}

/// Global and per-provider permit pools
pub struct AdmissionController {
    global: Arc<PermitPool>,
    providers: DashMap<String, Arc<PermitPool>>,
    config: DispatchConfig,
}

impl AdmissionController {
    /// Create pools sized from `config`
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            global: Arc::new(PermitPool::new(config.global_max_inflight)),
            providers: DashMap::new(),
            config: config.clone(),
        }
    }

    /// Pool for `provider`, created on first use
    pub fn provider_pool(&self, provider: &str) -> Arc<PermitPool> {
        let pool = self
            .providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(PermitPool::new(self.config.provider_limit(provider))));
        Arc::clone(pool.value())
    }

    /// Take global → provider → session permits, or none at all
    ///
    /// # Errors
    ///
    /// [`AdmissionError`] naming the first level that was full. Permits
    /// already taken are released before returning.
    pub fn admit(&self, provider: Option<&str>, session: &Arc<PermitPool>) -> Result<AdmissionTicket, AdmissionError> {
        let global = self.global.try_acquire().ok_or(AdmissionError::Global)?;

        let provider_permit = match provider {
            Some(name) => Some(
                self.provider_pool(name)
                    .try_acquire()
                    .ok_or_else(|| AdmissionError::Provider(name.to_string()))?,
            ),
            None => None,
        };

        let session = session.try_acquire().ok_or(AdmissionError::Session)?;

        Ok(AdmissionTicket {
            _session: session,
            _provider: provider_permit,
            _global: global,
        })
    }

    /// Calls holding a global permit
    pub fn inflight(&self) -> usize {
        self.global.in_use()
    }

    /// Configured caps
    pub fn capacity(&self) -> Capacity {
        Capacity {
            global: self.global.capacity(),
            provider: self.config.provider_max_inflight,
            session: self.config.session_max_inflight,
        }
    }

    /// Global pool counters
    pub fn global_stats(&self) -> PoolStats {
        self.global.stats()
    }

    /// Counters for every provider pool created so far
    pub fn provider_stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<_> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(global: usize, provider: usize) -> AdmissionController {
        AdmissionController::new(&DispatchConfig {
            global_max_inflight: global,
            provider_max_inflight: provider,
            ..DispatchConfig::default()
        })
    }

    #[test]
    fn test_pool_is_non_blocking_and_raii() {
        let pool = Arc::new(PermitPool::new(1));
        let first = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(first);
        assert!(pool.try_acquire().is_some());

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn test_global_cap_rejects_second_call() {
        let admission = controller(1, 5);
        let session = Arc::new(PermitPool::new(4));

        let held = admission.admit(None, &session).unwrap();
        assert_eq!(admission.admit(None, &session).unwrap_err(), AdmissionError::Global);
        assert_eq!(admission.inflight(), 1);
        drop(held);
        assert_eq!(admission.inflight(), 0);
    }

    #[test]
    fn test_failure_releases_earlier_permits() {
        let admission = controller(4, 1);
        let session_a = Arc::new(PermitPool::new(4));
        let session_b = Arc::new(PermitPool::new(0));

        let held = admission.admit(Some("xai"), &session_a).unwrap();
        assert_eq!(
            admission.admit(Some("xai"), &session_a).unwrap_err(),
            AdmissionError::Provider("xai".into())
        );
        assert_eq!(admission.inflight(), 1);

        // Session level fails after global and provider were taken
        assert_eq!(admission.admit(Some("moonshot"), &session_b).unwrap_err(), AdmissionError::Session);
        assert_eq!(admission.inflight(), 1);
        assert_eq!(admission.provider_pool("moonshot").available(), 1);

        drop(held);
        assert_eq!(admission.provider_pool("xai").available(), 1);
        assert_eq!(session_a.available(), 4);
    }

    #[test]
    fn test_provider_limits_override_default() {
        let mut config = DispatchConfig::default();
        config.provider_limits.insert("openrouter".into(), 2);
        let admission = AdmissionController::new(&config);
        assert_eq!(admission.provider_pool("openrouter").capacity(), 2);
        assert_eq!(admission.provider_pool("xai").capacity(), config.provider_max_inflight);
        assert_eq!(admission.provider_stats().len(), 2);
    }

    #[test]
    fn test_permits_balance_across_threads() {
        let admission = Arc::new(controller(3, 2));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let admission = Arc::clone(&admission);
                std::thread::spawn(move || {
                    let session = Arc::new(PermitPool::new(1));
                    for _ in 0..500 {
                        let provider = if i % 2 == 0 { Some("xai") } else { None };
                        if let Ok(ticket) = admission.admit(provider, &session) {
                            assert!(admission.inflight() <= 3);
                            drop(ticket);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admission.inflight(), 0);
        let global = admission.global_stats();
        assert_eq!(global.acquired, global.released);
        assert_eq!(admission.provider_pool("xai").available(), 2);
    }
}
