//! Process-level guards
//!
//! - [`ProcessLock`]: one gateway per lock path, with stale-lock recovery
//! - [`HealthSnapshot`]: periodic liveness file read back by the lock

pub mod lock;
pub mod snapshot;

pub use lock::{LivenessProbe, LockError, ProcessLock};
pub use snapshot::{snapshot_is_stale, spawn_snapshot_task, HealthSnapshot};
