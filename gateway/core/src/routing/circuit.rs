//! Per-provider Circuit Breakers
//!
//! ```text
//! +--------+  failures >= threshold  +------+   cooloff elapsed   +-----------+
//! | Closed | ----------------------> | Open | ------------------> | Half-Open |
//! +--------+                         +------+                     +-----------+
//!     ^                                  ^          any failure        |
//!     |                                  +-----------------------------+
//!     |              successes >= reset_threshold                      |
//!     +----------------------------------------------------------------+
//! ```
//!
//! - **Closed**: normal operation
//! - **Open**: requests rejected until the cooloff elapses
//! - **Half-Open**: permissive probing; every request is let through until the
//!   circuit either closes or re-opens
//!
//! Each key owns an independent, atomically updated [`Circuit`]. The
//! [`CircuitBreakers`] map is a `DashMap`, so one provider's transitions never
//! contend with another's.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use super::config::CircuitConfig;

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,
    /// Rejecting requests
    Open,
    /// Probing recovery
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            OPEN => Self::Open,
            HALF_OPEN => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Point-in-time view of one circuit
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Circuit key (provider name)
    pub key: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failures: u32,
    /// Consecutive successes
    pub successes: u32,
}

/// Breaker state for a single key
pub struct Circuit {
    key: String,
    config: CircuitConfig,
    state: AtomicU32,
    failures: AtomicU32,
    successes: AtomicU32,
    /// Millis since `epoch` at which the circuit last opened
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl Circuit {
    /// Create a closed circuit
    pub fn new(key: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: AtomicU32::new(CLOSED),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Current state, without triggering transitions
    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether a request may proceed
    ///
    /// An open circuit whose cooloff has elapsed moves to half-open here.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => self.maybe_transition_to_half_open(),
        }
    }

    fn maybe_transition_to_half_open(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let cooloff = u64::try_from(self.config.cooloff().as_millis()).unwrap_or(u64::MAX);

        if self.now_millis().saturating_sub(opened_at) < cooloff {
            return false;
        }

        match self
            .state
            .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.successes.store(0, Ordering::Release);
                tracing::info!(provider = %self.key, "Circuit half-open, probing");
                true
            }
            // Another caller already moved it on
            Err(actual) => actual != OPEN,
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;

        if self.state() == CircuitState::HalfOpen && successes >= self.config.reset_threshold {
            self.state.store(CLOSED, Ordering::Release);
            self.successes.store(0, Ordering::Release);
            tracing::info!(provider = %self.key, "Circuit closed, provider recovered");
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.successes.store(0, Ordering::Release);
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::Closed if failures >= self.config.failure_threshold => self.open(),
            CircuitState::HalfOpen => self.open(),
            _ => {}
        }
    }

    fn open(&self) {
        self.opened_at_ms.store(self.now_millis(), Ordering::Release);
        self.state.store(OPEN, Ordering::Release);
        tracing::warn!(
            provider = %self.key,
            consecutive_failures = self.failures.load(Ordering::Relaxed),
            cooloff_ms = self.config.cooloff_ms,
            "Circuit opened"
        );
    }

    /// Return to closed with cleared counters
    pub fn reset(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
    }

    /// Snapshot of the counters
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            key: self.key.clone(),
            state: self.state(),
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
        }
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Keyed collection of circuits
pub struct CircuitBreakers {
    config: CircuitConfig,
    circuits: DashMap<String, Arc<Circuit>>,
}

impl CircuitBreakers {
    /// Create an empty collection
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    /// Get or create the circuit for a key
    pub fn circuit(&self, key: &str) -> Arc<Circuit> {
        if let Some(existing) = self.circuits.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Circuit::new(key, self.config.clone())))
                .value(),
        )
    }

    /// Whether a request to `key` may proceed
    pub fn allow_request(&self, key: &str) -> bool {
        self.circuit(key).allow_request()
    }

    /// Whether `key` is currently rejecting, applying the cooloff check
    pub fn is_open(&self, key: &str) -> bool {
        !self.allow_request(key)
    }

    /// Record success for `key`
    pub fn record_success(&self, key: &str) {
        self.circuit(key).record_success();
    }

    /// Record failure for `key`
    pub fn record_failure(&self, key: &str) {
        self.circuit(key).record_failure();
    }

    /// State of `key` without transitions; unknown keys are closed
    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .get(key)
            .map_or(CircuitState::Closed, |c| c.state())
    }

    /// Snapshots of every known circuit
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> = self.circuits.iter().map(|c| c.snapshot()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Clear every circuit
    pub fn reset_all(&self) {
        for circuit in &self.circuits {
            circuit.reset();
        }
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}
